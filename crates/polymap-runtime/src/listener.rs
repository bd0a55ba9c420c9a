use polymap_datastore::DatastoreSession;

use crate::error::RuntimeResult;
use crate::instance::Instance;

/// Lifecycle hooks invoked by a session.
///
/// Every hook defaults to a no-op. A failing `post_create` aborts the
/// creation and closes the new instance; a failing `pre_delete` prevents the
/// deletion. Hooks may call back into the session.
pub trait InstanceListener<S: DatastoreSession> {
    /// After `create` or `create_relation` built a new instance.
    fn post_create(&self, _instance: &Instance<S>) -> RuntimeResult<()> {
        Ok(())
    }

    /// After an existing record was first loaded into the cache.
    fn post_load(&self, _instance: &Instance<S>) -> RuntimeResult<()> {
        Ok(())
    }

    fn pre_delete(&self, _instance: &Instance<S>) -> RuntimeResult<()> {
        Ok(())
    }

    /// After the record was deleted. The instance is already closed.
    fn post_delete(&self, _instance: &Instance<S>) -> RuntimeResult<()> {
        Ok(())
    }
}
