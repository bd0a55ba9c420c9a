//! Sessions: the caller-facing API and the per-session state behind it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use polymap_datastore::DatastoreSession;
use polymap_types::{
    AccessorKind, CapabilitySet, Direction, MetadataError, MetadataProvider, TypeKind, TypeName,
    Value,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::InstanceCache;
use crate::config::RuntimeConfig;
use crate::dispatch::{DispatchTable, OperationRegistry};
use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::{Handle, Instance, InstanceSeq, RecordId};
use crate::listener::InstanceListener;
use crate::migration::Migration;
use crate::transaction::{Transaction, TransactionGuard, UnitFrame};
use crate::translator::{entity_of, Translator};

/// Unique identifier of a session, attached to its log events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// A new time-ordered identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything one session owns. Instances hold a weak reference to it.
pub(crate) struct SessionContext<S: DatastoreSession> {
    pub(crate) id: SessionId,
    pub(crate) config: RuntimeConfig,
    pub(crate) metadata: Arc<dyn MetadataProvider + Send + Sync>,
    operations: Arc<OperationRegistry<S>>,
    pub(crate) datastore: RefCell<S>,
    pub(crate) entities: RefCell<InstanceCache<S::EntityId, S>>,
    pub(crate) relations: RefCell<InstanceCache<S::RelationId, S>>,
    tables: RefCell<HashMap<CapabilitySet, Rc<DispatchTable<S>>>>,
    pub(crate) frames: RefCell<Vec<UnitFrame<S>>>,
    pub(crate) dirty: RefCell<HashMap<S::EntityId, S::Entity>>,
    listeners: RefCell<Vec<Rc<dyn InstanceListener<S>>>>,
    closed: Cell<bool>,
    this: Weak<SessionContext<S>>,
}

impl<S: DatastoreSession> SessionContext<S> {
    pub(crate) fn new(
        datastore: S,
        metadata: Arc<dyn MetadataProvider + Send + Sync>,
        operations: Arc<OperationRegistry<S>>,
        config: RuntimeConfig,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            id: SessionId::new(),
            config,
            metadata,
            operations,
            datastore: RefCell::new(datastore),
            entities: RefCell::new(InstanceCache::new()),
            relations: RefCell::new(InstanceCache::new()),
            tables: RefCell::new(HashMap::new()),
            frames: RefCell::new(Vec::new()),
            dirty: RefCell::new(HashMap::new()),
            listeners: RefCell::new(Vec::new()),
            closed: Cell::new(false),
            this: this.clone(),
        })
    }

    pub(crate) fn ensure_open(&self) -> RuntimeResult<()> {
        if self.closed.get() {
            return Err(RuntimeError::SessionClosed);
        }
        Ok(())
    }

    pub(crate) fn guard(&self) -> TransactionGuard {
        TransactionGuard::new(self.config.transaction_attribute)
    }

    /// The dispatch table for a capability set, built on first use.
    pub(crate) fn table_for(
        &self,
        capabilities: &CapabilitySet,
    ) -> RuntimeResult<Rc<DispatchTable<S>>> {
        if let Some(table) = self.tables.borrow().get(capabilities) {
            return Ok(Rc::clone(table));
        }
        let table = Rc::new(DispatchTable::build(
            capabilities,
            self.metadata.as_ref(),
            &self.operations,
        )?);
        self.tables
            .borrow_mut()
            .insert(capabilities.clone(), Rc::clone(&table));
        Ok(table)
    }

    pub(crate) fn build_instance(
        &self,
        id: RecordId<S>,
        handle: Handle<S>,
        capabilities: CapabilitySet,
    ) -> RuntimeResult<Instance<S>> {
        let table = self.table_for(&capabilities)?;
        Ok(Instance::new(id, handle, capabilities, table, self.this.clone()))
    }

    /// The instance for an entity handle, loading it into the cache on a
    /// miss.
    pub(crate) fn entity_instance(&self, entity: S::Entity) -> RuntimeResult<Instance<S>> {
        self.ensure_open()?;
        let id = self.datastore.borrow().entity_id(&entity);
        let (instance, created) = self.entities.borrow_mut().get_or_create(id.clone(), || {
            let discriminators = self.datastore.borrow().entity_discriminators(&entity)?;
            let capabilities = self.metadata.types_for(&discriminators);
            self.build_instance(
                RecordId::Entity(id.clone()),
                Handle::Entity(entity.clone()),
                capabilities,
            )
        })?;
        if created {
            debug!(
                session = %self.id,
                %id,
                capabilities = %instance.capabilities(),
                "entity instance loaded"
            );
            self.notify(&instance, |l, i| l.post_load(i))?;
        }
        Ok(instance)
    }

    /// The instance for a relation handle. The relationship must be bound
    /// to a relation type.
    pub(crate) fn relation_instance(&self, relation: S::Relation) -> RuntimeResult<Instance<S>> {
        self.ensure_open()?;
        let id = self.datastore.borrow().relation_id(&relation);
        let (instance, created) = self.relations.borrow_mut().get_or_create(id.clone(), || {
            let relationship = self.datastore.borrow().relation_discriminator(&relation)?;
            let ty = self.metadata.relation_type(&relationship).ok_or_else(|| {
                RuntimeError::Configuration(format!(
                    "relationship '{relationship}' has no relation type"
                ))
            })?;
            let capabilities = CapabilitySet::of([ty.name.clone()]);
            self.build_instance(
                RecordId::Relation(id.clone()),
                Handle::Relation(relation.clone()),
                capabilities,
            )
        })?;
        if created {
            debug!(
                session = %self.id,
                %id,
                capabilities = %instance.capabilities(),
                "relation instance loaded"
            );
            self.notify(&instance, |l, i| l.post_load(i))?;
        }
        Ok(instance)
    }

    /// Point any cached instance for the handle's record at `handle`.
    pub(crate) fn refresh(&self, handle: &Handle<S>) {
        let id = match handle {
            Handle::Entity(e) => RecordId::Entity(self.datastore.borrow().entity_id(e)),
            Handle::Relation(r) => RecordId::Relation(self.datastore.borrow().relation_id(r)),
        };
        if let Some(instance) = self.cached(&id) {
            instance.set_handle(handle.clone());
        }
    }

    /// Refresh after a write and remember the entity for the next flush.
    pub(crate) fn touch(&self, handle: &Handle<S>) {
        self.refresh(handle);
        if let Handle::Entity(entity) = handle {
            let id = self.datastore.borrow().entity_id(entity);
            self.dirty.borrow_mut().insert(id, entity.clone());
        }
    }

    /// Evict and close whatever instance is cached for `id`.
    pub(crate) fn retire(&self, id: &RecordId<S>) {
        let closed = match id {
            RecordId::Entity(id) => {
                self.dirty.borrow_mut().remove(id);
                self.entities.borrow_mut().close(id)
            }
            RecordId::Relation(id) => self.relations.borrow_mut().close(id),
        };
        if closed {
            debug!(session = %self.id, %id, "instance retired");
        }
    }

    /// Close the cached instance of a record whose state a rollback
    /// replaced. Its dirty entry is kept while the record still exists.
    pub(crate) fn discard(&self, id: &RecordId<S>) {
        let closed = match id {
            RecordId::Entity(id) => {
                let gone = self.dirty.borrow().get(id).is_some_and(|entity| {
                    self.datastore.borrow().entity_discriminators(entity).is_err()
                });
                if gone {
                    self.dirty.borrow_mut().remove(id);
                }
                self.entities.borrow_mut().close(id)
            }
            RecordId::Relation(id) => self.relations.borrow_mut().close(id),
        };
        if closed {
            debug!(session = %self.id, %id, "instance discarded by rollback");
        }
    }

    /// Close `instance`, evicting it if it is the cached one for its
    /// identity.
    pub(crate) fn close_instance(&self, instance: &Instance<S>) {
        let cached = self.cached(instance.id());
        if cached.is_some_and(|c| c.is_same(instance)) {
            self.retire(instance.id());
        }
        instance.mark_closed();
    }

    pub(crate) fn cached(&self, id: &RecordId<S>) -> Option<Instance<S>> {
        match id {
            RecordId::Entity(id) => self.entities.borrow().get(id),
            RecordId::Relation(id) => self.relations.borrow().get(id),
        }
    }

    pub(crate) fn ensure_managed(&self, instance: &Instance<S>) -> RuntimeResult<()> {
        if !instance.belongs_to(self) {
            return Err(RuntimeError::NotManaged(format!(
                "instance {} belongs to another session",
                instance.id()
            )));
        }
        if instance.is_closed() {
            return Err(instance.closed_error());
        }
        Ok(())
    }

    pub(crate) fn flush_dirty(&self) -> RuntimeResult<usize> {
        let dirty: Vec<S::Entity> = self.dirty.borrow_mut().drain().map(|(_, e)| e).collect();
        let mut datastore = self.datastore.borrow_mut();
        for entity in &dirty {
            datastore.flush_entity(entity)?;
        }
        if !dirty.is_empty() {
            debug!(session = %self.id, count = dirty.len(), "flushed dirty entities");
        }
        Ok(dirty.len())
    }

    /// Close and drop every cached instance.
    pub(crate) fn clear_caches(&self) -> usize {
        let entities = self.entities.borrow_mut().clear();
        let relations = self.relations.borrow_mut().clear();
        self.dirty.borrow_mut().clear();
        debug!(session = %self.id, entities, relations, "instance caches cleared");
        entities + relations
    }

    pub(crate) fn add_listener(&self, listener: Rc<dyn InstanceListener<S>>) {
        self.listeners.borrow_mut().push(listener);
    }

    /// Run a hook on every listener. Listeners may call back into the
    /// session.
    pub(crate) fn notify(
        &self,
        instance: &Instance<S>,
        hook: impl Fn(&dyn InstanceListener<S>, &Instance<S>) -> RuntimeResult<()>,
    ) -> RuntimeResult<()> {
        let listeners: Vec<_> = self.listeners.borrow().clone();
        for listener in listeners {
            hook(listener.as_ref(), instance)?;
        }
        Ok(())
    }

    pub(crate) fn close(&self) -> RuntimeResult<()> {
        if self.closed.get() {
            return Ok(());
        }
        loop {
            let Some(origin) = self.innermost_origin() else {
                break;
            };
            warn!(
                session = %self.id,
                ?origin,
                "rolling back unit of work left open at session close"
            );
            self.rollback_unit(origin)?;
        }
        let cleared = self.clear_caches();
        self.closed.set(true);
        info!(session = %self.id, cleared, "session closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A unit-of-work scope over one datastore session.
///
/// Sessions and their instances are `!Send`. Open one session per thread.
pub struct Session<S: DatastoreSession> {
    context: Rc<SessionContext<S>>,
}

impl<S: DatastoreSession> Session<S> {
    pub(crate) fn new(context: Rc<SessionContext<S>>) -> Self {
        info!(session = %context.id, "session opened");
        Self { context }
    }

    pub fn session_id(&self) -> SessionId {
        self.context.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.context.config
    }

    pub fn metadata(&self) -> &dyn MetadataProvider {
        self.context.metadata.as_ref()
    }

    /// Explicit transaction demarcation.
    pub fn transaction(&self) -> Transaction<S> {
        Transaction::new(Rc::clone(&self.context))
    }

    /// Create a new entity with the given capability set.
    pub fn create<I, T>(&self, types: I) -> RuntimeResult<Instance<S>>
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeName>,
    {
        let ctx = &self.context;
        ctx.ensure_open()?;
        let capabilities = CapabilitySet::of(types);
        if capabilities.is_empty() {
            return Err(RuntimeError::Configuration("cannot create an entity without types".into()));
        }
        for ty in &capabilities {
            let descriptor = ctx
                .metadata
                .type_descriptor(ty.as_str())
                .ok_or_else(|| MetadataError::UnknownType(ty.to_string()))?;
            if descriptor.is_relation() {
                return Err(RuntimeError::Configuration(format!(
                    "{ty} is a relation type; use create_relation"
                )));
            }
        }
        let discriminators = ctx.metadata.discriminators(&capabilities)?;

        let instance = ctx.guard().run(ctx, || {
            let entity = ctx
                .datastore
                .borrow_mut()
                .create_entity(&capabilities, &discriminators)?;
            let id = ctx.datastore.borrow().entity_id(&entity);
            let instance = ctx.build_instance(
                RecordId::Entity(id.clone()),
                Handle::Entity(entity.clone()),
                capabilities.clone(),
            )?;
            ctx.entities.borrow_mut().insert(id.clone(), instance.clone());
            ctx.track_volatile(RecordId::Entity(id.clone()));
            ctx.dirty.borrow_mut().insert(id, entity);
            Ok(instance)
        })?;
        debug!(session = %ctx.id, id = %instance.id(), %capabilities, "entity created");

        if let Err(e) = ctx.notify(&instance, |l, i| l.post_create(i)) {
            ctx.close_instance(&instance);
            return Err(e);
        }
        Ok(instance)
    }

    /// Find entities of `ty` by the value of its indexed property.
    pub fn find(&self, ty: &str, value: impl Into<Value>) -> RuntimeResult<InstanceSeq<S>> {
        let ctx = &self.context;
        ctx.ensure_open()?;
        let descriptor = ctx
            .metadata
            .type_descriptor(ty)
            .ok_or_else(|| MetadataError::UnknownType(ty.to_string()))?;
        let discriminator = descriptor
            .discriminator
            .clone()
            .ok_or_else(|| RuntimeError::Configuration(format!("type {ty} has no discriminator")))?;
        let indexed = descriptor
            .indexed
            .as_deref()
            .ok_or_else(|| {
                RuntimeError::Configuration(format!("type {ty} has no indexed property"))
            })?;
        let capabilities = CapabilitySet::of([descriptor.name.clone()]);
        let key = match ctx.metadata.accessor(&capabilities, indexed)?.map(|a| &a.kind) {
            Some(AccessorKind::Primitive(key)) => key.clone(),
            _ => {
                return Err(RuntimeError::Configuration(format!(
                    "indexed accessor {ty}.{indexed} is not a primitive property"
                )))
            }
        };
        let value = value.into();

        let cursor = ctx.guard().run(ctx, || {
            Ok(ctx
                .datastore
                .borrow()
                .find_entity(descriptor, &discriminator, &key, &value)?)
        })?;
        let resolver = Rc::clone(ctx);
        Ok(InstanceSeq::new(
            cursor.map(move |entity| resolver.entity_instance(entity)),
        ))
    }

    /// Create a relation instance of `relation_type` between two entities.
    ///
    /// If either entity declares a single-valued accessor for the
    /// relationship on its side, an existing relation there is replaced.
    pub fn create_relation(
        &self,
        from: &Instance<S>,
        relation_type: &str,
        to: &Instance<S>,
    ) -> RuntimeResult<Instance<S>> {
        let ctx = &self.context;
        ctx.ensure_open()?;
        ctx.ensure_managed(from)?;
        ctx.ensure_managed(to)?;
        let descriptor = ctx
            .metadata
            .type_descriptor(relation_type)
            .ok_or_else(|| MetadataError::UnknownType(relation_type.to_string()))?;
        let relationship = match &descriptor.kind {
            TypeKind::Relation { relationship } => relationship.clone(),
            TypeKind::Entity => {
                return Err(RuntimeError::Configuration(format!(
                    "{relation_type} is not a relation type"
                )))
            }
        };

        let instance = ctx.guard().run(ctx, || {
            let translator = Translator::new(ctx);
            let from_entity = entity_of(from)?;
            let to_entity = entity_of(to)?;
            let sides = [
                (from, &from_entity, Direction::From),
                (to, &to_entity, Direction::To),
            ];
            for (side, entity, direction) in sides {
                let accessor =
                    ctx.metadata.relation_accessor(side.capabilities(), &relationship, direction)?;
                let Some(accessor) = accessor else {
                    continue;
                };
                let single = accessor.kind.relation().filter(|_| accessor.kind.is_single());
                let Some(rel) = single else {
                    continue;
                };
                if let Some(existing) = translator.read_single_relation(entity, rel)? {
                    translator.remove_relation(&existing)?;
                }
            }
            let relation = ctx
                .datastore
                .borrow_mut()
                .create_relation(&from_entity, &relationship, Direction::From, &to_entity)?;
            ctx.refresh(&Handle::Entity(from_entity));
            ctx.refresh(&Handle::Entity(to_entity));
            let id = ctx.datastore.borrow().relation_id(&relation);
            let instance = ctx.build_instance(
                RecordId::Relation(id.clone()),
                Handle::Relation(relation),
                CapabilitySet::of([descriptor.name.clone()]),
            )?;
            ctx.relations.borrow_mut().insert(id.clone(), instance.clone());
            ctx.track_volatile(RecordId::Relation(id));
            Ok(instance)
        })?;
        debug!(session = %ctx.id, id = %instance.id(), %relation_type, "relation created");

        if let Err(e) = ctx.notify(&instance, |l, i| l.post_create(i)) {
            ctx.close_instance(&instance);
            return Err(e);
        }
        Ok(instance)
    }

    /// Delete the record behind an entity or relation instance and retire
    /// the instance.
    pub fn delete(&self, instance: &Instance<S>) -> RuntimeResult<()> {
        let ctx = &self.context;
        ctx.ensure_open()?;
        ctx.ensure_managed(instance)?;
        ctx.notify(instance, |l, i| l.pre_delete(i))?;
        ctx.guard().run(ctx, || {
            match instance.handle() {
                Handle::Entity(entity) => ctx.datastore.borrow_mut().delete_entity(&entity)?,
                Handle::Relation(relation) => Translator::new(ctx).remove_relation(&relation)?,
            }
            ctx.retire(instance.id());
            Ok(())
        })?;
        instance.mark_closed();
        debug!(session = %ctx.id, id = %instance.id(), "instance deleted");
        ctx.notify(instance, |l, i| l.post_delete(i))
    }

    /// The backend identity of a managed instance.
    pub fn id(&self, instance: &Instance<S>) -> RuntimeResult<RecordId<S>> {
        self.context.ensure_managed(instance)?;
        Ok(instance.id().clone())
    }

    /// Start a type migration of `instance`.
    pub fn migrate(&self, instance: &Instance<S>) -> Migration<'_, S> {
        Migration::new(self, instance.clone())
    }

    /// Write back every dirty entity. Returns how many were flushed.
    pub fn flush(&self) -> RuntimeResult<usize> {
        self.context.ensure_open()?;
        self.context.flush_dirty()
    }

    /// Roll back anything left open, close every cached instance and refuse
    /// further use. Idempotent.
    pub fn close(&self) -> RuntimeResult<()> {
        self.context.close()
    }

    pub fn is_closed(&self) -> bool {
        self.context.closed.get()
    }

    /// The live cached instance for `id`, if any.
    pub fn instance(&self, id: &RecordId<S>) -> Option<Instance<S>> {
        self.context.cached(id)
    }

    /// Evict an instance from the cache without closing it.
    pub fn remove_instance(&self, instance: &Instance<S>) -> Option<Instance<S>> {
        match instance.id() {
            RecordId::Entity(id) => self.context.entities.borrow_mut().remove(id),
            RecordId::Relation(id) => self.context.relations.borrow_mut().remove(id),
        }
    }

    /// Close an instance, evicting it if it is cached.
    pub fn close_instance(&self, instance: &Instance<S>) {
        self.context.close_instance(instance);
    }

    /// Number of instances currently cached.
    pub fn cached_instances(&self) -> usize {
        self.context.entities.borrow().len() + self.context.relations.borrow().len()
    }

    /// Close every cached instance. Returns how many were cleared.
    pub fn clear_cache(&self) -> usize {
        self.context.clear_caches()
    }

    pub fn register_listener(&self, listener: impl InstanceListener<S> + 'static) {
        self.context.add_listener(Rc::new(listener));
    }

    pub(crate) fn context(&self) -> &Rc<SessionContext<S>> {
        &self.context
    }
}

impl<S: DatastoreSession> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.context.id)
            .field("depth", &self.context.depth())
            .field("cached", &self.cached_instances())
            .field("closed", &self.is_closed())
            .finish()
    }
}
