use std::fmt;
use std::sync::Arc;

use polymap_datastore::Datastore;
use polymap_types::{AccessorKind, MetadataProvider};
use tracing::info;

use crate::config::RuntimeConfig;
use crate::dispatch::{CustomOperation, OperationRegistry};
use crate::error::{RuntimeError, RuntimeResult};
use crate::session::{Session, SessionContext};

/// Opens sessions over one datastore with one set of type metadata.
///
/// The factory is immutable once built and can be shared between threads
/// when its datastore can; the sessions it opens cannot.
pub struct SessionFactory<D: Datastore> {
    datastore: D,
    metadata: Arc<dyn MetadataProvider + Send + Sync>,
    operations: Arc<OperationRegistry<D::Session>>,
    config: RuntimeConfig,
}

impl<D: Datastore> SessionFactory<D> {
    pub fn builder(
        datastore: D,
        metadata: impl MetadataProvider + Send + Sync + 'static,
    ) -> SessionFactoryBuilder<D> {
        SessionFactoryBuilder {
            datastore,
            metadata: Arc::new(metadata),
            operations: OperationRegistry::new(),
            config: RuntimeConfig::default(),
        }
    }

    /// Open a new session with empty caches and no active transaction.
    pub fn open(&self) -> RuntimeResult<Session<D::Session>> {
        let datastore = self.datastore.create_session()?;
        let context = SessionContext::new(
            datastore,
            Arc::clone(&self.metadata),
            Arc::clone(&self.operations),
            self.config.clone(),
        );
        Ok(Session::new(context))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn datastore(&self) -> &D {
        &self.datastore
    }

    pub fn metadata(&self) -> &dyn MetadataProvider {
        self.metadata.as_ref()
    }
}

impl<D: Datastore> fmt::Debug for SessionFactory<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("config", &self.config)
            .field("types", &self.metadata.type_names().len())
            .field("operations", &self.operations)
            .finish()
    }
}

/// Builder for [`SessionFactory`].
pub struct SessionFactoryBuilder<D: Datastore> {
    datastore: D,
    metadata: Arc<dyn MetadataProvider + Send + Sync>,
    operations: OperationRegistry<D::Session>,
    config: RuntimeConfig,
}

impl<D: Datastore> SessionFactoryBuilder<D> {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the logic behind `Implemented` accessors whose operation key
    /// is `key`.
    pub fn implement(
        mut self,
        key: impl Into<String>,
        operation: impl CustomOperation<D::Session> + Send + Sync + 'static,
    ) -> Self {
        self.operations.register(key, operation);
        self
    }

    /// Validate the configuration and build the factory.
    ///
    /// Fails if any declared `Implemented` accessor has no registered
    /// operation.
    pub fn build(self) -> RuntimeResult<SessionFactory<D>> {
        let names = self.metadata.type_names();
        for name in &names {
            let Some(ty) = self.metadata.type_descriptor(name.as_str()) else {
                continue;
            };
            for accessor in &ty.accessors {
                if let AccessorKind::Implemented { operation } = &accessor.kind {
                    if !self.operations.contains(operation) {
                        return Err(RuntimeError::Configuration(format!(
                            "no implementation registered for operation '{operation}' ({}.{})",
                            ty.name, accessor.name
                        )));
                    }
                }
            }
        }
        info!(
            types = names.len(),
            operations = self.operations.len(),
            transaction_attribute = ?self.config.transaction_attribute,
            cache_scope = ?self.config.cache_scope,
            "session factory built"
        );
        Ok(SessionFactory {
            datastore: self.datastore,
            metadata: self.metadata,
            operations: Arc::new(self.operations),
            config: self.config,
        })
    }
}
