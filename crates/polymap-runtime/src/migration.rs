//! Type migration.
//!
//! Changes the capability set of an entity without changing its identity.
//! The old instance is evicted and closed; a new instance bound to the same
//! identity is built for the target set. State stored under capabilities
//! that were dropped stays in the backend and becomes readable again if
//! the capability is added back.

use std::fmt;

use polymap_datastore::DatastoreSession;
use polymap_types::{CapabilitySet, TypeName};
use tracing::info;

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::{Handle, Instance, RecordId};
use crate::session::Session;

type Transfer<'s, S> = Box<dyn FnOnce(&Instance<S>, &Instance<S>) -> RuntimeResult<()> + 's>;

/// Builder for one migration, obtained from [`Session::migrate`].
pub struct Migration<'s, S: DatastoreSession> {
    session: &'s Session<S>,
    instance: Instance<S>,
    target: Option<CapabilitySet>,
    add: CapabilitySet,
    remove: CapabilitySet,
    transfer: Option<Transfer<'s, S>>,
}

impl<'s, S: DatastoreSession> Migration<'s, S> {
    pub(crate) fn new(session: &'s Session<S>, instance: Instance<S>) -> Self {
        Self {
            session,
            instance,
            target: None,
            add: CapabilitySet::new(),
            remove: CapabilitySet::new(),
            transfer: None,
        }
    }

    /// Migrate to exactly these types.
    pub fn to<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeName>,
    {
        self.target = Some(CapabilitySet::of(types));
        self
    }

    /// Add a type to the target set.
    pub fn add(mut self, ty: impl Into<TypeName>) -> Self {
        self.add.insert(ty);
        self
    }

    /// Remove a type from the target set.
    pub fn remove(mut self, ty: impl Into<TypeName>) -> Self {
        self.remove.insert(ty);
        self
    }

    /// Run `transfer(old, new)` once the new instance is installed.
    ///
    /// A failing transfer is returned from [`execute`](Self::execute) but does
    /// not undo the migration.
    pub fn with_transfer(
        mut self,
        transfer: impl FnOnce(&Instance<S>, &Instance<S>) -> RuntimeResult<()> + 's,
    ) -> Self {
        self.transfer = Some(Box::new(transfer));
        self
    }

    /// The capability set the instance will have after the migration.
    pub fn target(&self) -> CapabilitySet {
        self.target
            .as_ref()
            .unwrap_or_else(|| self.instance.capabilities())
            .union(&self.add)
            .difference(&self.remove)
    }

    /// Perform the migration and return the new instance.
    pub fn execute(self) -> RuntimeResult<Instance<S>> {
        let session = self.session;
        let ctx = session.context();
        ctx.ensure_open()?;
        ctx.ensure_managed(&self.instance)?;
        let Handle::Entity(entity) = self.instance.handle() else {
            return Err(RuntimeError::InvalidMigration(format!(
                "relation {} cannot be migrated",
                self.instance.id()
            )));
        };

        let source = self.instance.capabilities().clone();
        let target = self.target();
        if target.is_empty() {
            return Err(RuntimeError::InvalidMigration(format!(
                "migrating {} would leave it without types",
                self.instance.id()
            )));
        }
        for ty in &target {
            let relation = ctx
                .metadata
                .type_descriptor(ty.as_str())
                .map(|d| d.is_relation())
                .ok_or_else(|| {
                    RuntimeError::InvalidMigration(format!("unknown target type {ty}"))
                })?;
            if relation {
                return Err(RuntimeError::InvalidMigration(format!(
                    "target type {ty} is a relation type"
                )));
            }
        }
        let discriminators = ctx.metadata.discriminators(&source)?;
        let target_discriminators = ctx.metadata.discriminators(&target)?;
        // Resolve the target dispatch table before the backend is touched.
        ctx.table_for(&target)?;
        let id = ctx.datastore.borrow().entity_id(&entity);

        let Migration {
            instance: old,
            transfer,
            ..
        } = self;

        let new = ctx.guard().run(ctx, || {
            let migrated = ctx.datastore.borrow_mut().migrate_entity(
                &entity,
                &source,
                &discriminators,
                &target,
                &target_discriminators,
            )?;
            // A reloaded instance may have replaced `old` in the cache.
            let cached = ctx.entities.borrow_mut().remove(&id);
            if let Some(stale) = cached.filter(|c| !c.is_same(&old)) {
                stale.mark_closed();
            }
            let new = ctx.build_instance(
                RecordId::Entity(id.clone()),
                Handle::Entity(migrated.clone()),
                target.clone(),
            )?;
            ctx.entities.borrow_mut().insert(id.clone(), new.clone());
            ctx.track_volatile(RecordId::Entity(id.clone()));
            if let Some(dirty) = ctx.dirty.borrow_mut().get_mut(&id) {
                *dirty = migrated;
            }
            Ok(new)
        })?;
        info!(session = %ctx.id, %id, from = %source, to = %target, "instance migrated");

        let transferred = match transfer {
            Some(transfer) => transfer(&old, &new),
            None => Ok(()),
        };
        old.mark_closed();
        transferred?;
        Ok(new)
    }
}

impl<S: DatastoreSession> fmt::Debug for Migration<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("instance", &self.instance)
            .field("target", &self.target())
            .field("transfer", &self.transfer.is_some())
            .finish()
    }
}
