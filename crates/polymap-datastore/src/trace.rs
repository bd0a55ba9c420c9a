//! Logging decorator for datastores.
//!
//! [`TracingDatastore`] wraps any [`Datastore`] and hands out
//! [`TracingSession`]s that forward every call unchanged, emitting a
//! `trace` event before the call and a `debug` event when it fails.

use std::collections::BTreeSet;

use polymap_types::{
    CapabilitySet, Direction, Discriminator, PropertyDescriptor, TypeDescriptor, Value,
};
use tracing::{debug, trace};

use crate::cursor::ResultIter;
use crate::error::DatastoreResult;
use crate::traits::{Datastore, DatastoreSession};

/// A datastore whose sessions log every call.
#[derive(Clone, Debug, Default)]
pub struct TracingDatastore<D> {
    inner: D,
}

impl<D: Datastore> TracingDatastore<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: Datastore> Datastore for TracingDatastore<D> {
    type Session = TracingSession<D::Session>;

    fn create_session(&self) -> DatastoreResult<Self::Session> {
        trace!("create_session");
        Ok(TracingSession::new(self.inner.create_session()?))
    }
}

/// A session that logs every call and forwards it to `inner`.
#[derive(Debug)]
pub struct TracingSession<S> {
    inner: S,
}

impl<S: DatastoreSession> TracingSession<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn logged<T>(op: &'static str, result: DatastoreResult<T>) -> DatastoreResult<T> {
    if let Err(e) = &result {
        debug!(op, error = %e, "datastore call failed");
    }
    result
}

impl<S: DatastoreSession> DatastoreSession for TracingSession<S> {
    type EntityId = S::EntityId;
    type RelationId = S::RelationId;
    type Entity = S::Entity;
    type Relation = S::Relation;

    fn begin(&mut self) -> DatastoreResult<()> {
        trace!("begin");
        logged("begin", self.inner.begin())
    }

    fn commit(&mut self) -> DatastoreResult<()> {
        trace!("commit");
        logged("commit", self.inner.commit())
    }

    fn rollback(&mut self) -> DatastoreResult<()> {
        trace!("rollback");
        logged("rollback", self.inner.rollback())
    }

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    fn entity_id(&self, entity: &S::Entity) -> S::EntityId {
        self.inner.entity_id(entity)
    }

    fn entity_discriminators(
        &self,
        entity: &S::Entity,
    ) -> DatastoreResult<BTreeSet<Discriminator>> {
        trace!(?entity, "entity_discriminators");
        logged("entity_discriminators", self.inner.entity_discriminators(entity))
    }

    fn create_entity(
        &mut self,
        types: &CapabilitySet,
        discriminators: &BTreeSet<Discriminator>,
    ) -> DatastoreResult<S::Entity> {
        trace!(%types, ?discriminators, "create_entity");
        logged("create_entity", self.inner.create_entity(types, discriminators))
    }

    fn delete_entity(&mut self, entity: &S::Entity) -> DatastoreResult<()> {
        trace!(?entity, "delete_entity");
        logged("delete_entity", self.inner.delete_entity(entity))
    }

    fn find_entity(
        &self,
        ty: &TypeDescriptor,
        discriminator: &Discriminator,
        key: &PropertyDescriptor,
        value: &Value,
    ) -> DatastoreResult<ResultIter<S::Entity>> {
        trace!(ty = %ty.name, %discriminator, key = %key.key, %value, "find_entity");
        logged("find_entity", self.inner.find_entity(ty, discriminator, key, value))
    }

    fn migrate_entity(
        &mut self,
        entity: &S::Entity,
        types: &CapabilitySet,
        discriminators: &BTreeSet<Discriminator>,
        target_types: &CapabilitySet,
        target_discriminators: &BTreeSet<Discriminator>,
    ) -> DatastoreResult<S::Entity> {
        trace!(?entity, from = %types, to = %target_types, "migrate_entity");
        logged(
            "migrate_entity",
            self.inner
                .migrate_entity(entity, types, discriminators, target_types, target_discriminators),
        )
    }

    fn flush_entity(&mut self, entity: &S::Entity) -> DatastoreResult<()> {
        trace!(?entity, "flush_entity");
        logged("flush_entity", self.inner.flush_entity(entity))
    }

    fn entity_property(
        &self,
        entity: &S::Entity,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<Option<Value>> {
        trace!(?entity, key = %key.key, "entity_property");
        logged("entity_property", self.inner.entity_property(entity, key))
    }

    fn set_entity_property(
        &mut self,
        entity: &S::Entity,
        key: &PropertyDescriptor,
        value: Value,
    ) -> DatastoreResult<()> {
        trace!(?entity, key = %key.key, %value, "set_entity_property");
        logged("set_entity_property", self.inner.set_entity_property(entity, key, value))
    }

    fn remove_entity_property(
        &mut self,
        entity: &S::Entity,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<()> {
        trace!(?entity, key = %key.key, "remove_entity_property");
        logged("remove_entity_property", self.inner.remove_entity_property(entity, key))
    }

    fn relation_property(
        &self,
        relation: &S::Relation,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<Option<Value>> {
        trace!(?relation, key = %key.key, "relation_property");
        logged("relation_property", self.inner.relation_property(relation, key))
    }

    fn set_relation_property(
        &mut self,
        relation: &S::Relation,
        key: &PropertyDescriptor,
        value: Value,
    ) -> DatastoreResult<()> {
        trace!(?relation, key = %key.key, %value, "set_relation_property");
        logged("set_relation_property", self.inner.set_relation_property(relation, key, value))
    }

    fn remove_relation_property(
        &mut self,
        relation: &S::Relation,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<()> {
        trace!(?relation, key = %key.key, "remove_relation_property");
        logged("remove_relation_property", self.inner.remove_relation_property(relation, key))
    }

    fn relation_id(&self, relation: &S::Relation) -> S::RelationId {
        self.inner.relation_id(relation)
    }

    fn relation_discriminator(&self, relation: &S::Relation) -> DatastoreResult<Discriminator> {
        trace!(?relation, "relation_discriminator");
        logged("relation_discriminator", self.inner.relation_discriminator(relation))
    }

    fn create_relation(
        &mut self,
        source: &S::Entity,
        relationship: &Discriminator,
        direction: Direction,
        target: &S::Entity,
    ) -> DatastoreResult<S::Relation> {
        trace!(?source, %relationship, %direction, ?target, "create_relation");
        logged(
            "create_relation",
            self.inner.create_relation(source, relationship, direction, target),
        )
    }

    fn delete_relation(&mut self, relation: &S::Relation) -> DatastoreResult<()> {
        trace!(?relation, "delete_relation");
        logged("delete_relation", self.inner.delete_relation(relation))
    }

    fn from_entity(&self, relation: &S::Relation) -> DatastoreResult<S::Entity> {
        trace!(?relation, "from_entity");
        logged("from_entity", self.inner.from_entity(relation))
    }

    fn to_entity(&self, relation: &S::Relation) -> DatastoreResult<S::Entity> {
        trace!(?relation, "to_entity");
        logged("to_entity", self.inner.to_entity(relation))
    }

    fn relations(
        &self,
        entity: &S::Entity,
        relationship: &Discriminator,
        direction: Direction,
    ) -> DatastoreResult<ResultIter<S::Relation>> {
        trace!(?entity, %relationship, %direction, "relations");
        logged("relations", self.inner.relations(entity, relationship, direction))
    }

    fn single_relation(
        &self,
        entity: &S::Entity,
        relationship: &Discriminator,
        direction: Direction,
    ) -> DatastoreResult<Option<S::Relation>> {
        trace!(?entity, %relationship, %direction, "single_relation");
        logged("single_relation", self.inner.single_relation(entity, relationship, direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDatastore;

    #[test]
    fn forwards_calls_unchanged() {
        let store = InMemoryDatastore::new();
        let traced = TracingDatastore::new(store.clone());
        let mut session = traced.create_session().unwrap();
        session.begin().unwrap();
        let discs: BTreeSet<Discriminator> = [Discriminator::new("A")].into_iter().collect();
        let a = session.create_entity(&CapabilitySet::of(["A"]), &discs).unwrap();
        let key = PropertyDescriptor::new("v");
        session.set_entity_property(&a, &key, Value::Int(7)).unwrap();
        assert_eq!(session.entity_property(&a, &key).unwrap(), Some(Value::Int(7)));
        session.commit().unwrap();
        assert!(!session.inner().is_active());
        assert_eq!(store.node_count().unwrap(), 1);
    }

    #[test]
    fn errors_pass_through() {
        let traced = TracingDatastore::new(InMemoryDatastore::new());
        let mut session = traced.create_session().unwrap();
        assert_eq!(
            session.rollback().unwrap_err(),
            crate::error::DatastoreError::NoActiveTransaction
        );
    }
}
