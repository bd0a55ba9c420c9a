use std::collections::BTreeSet;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use polymap_types::{
    CapabilitySet, Direction, Discriminator, PropertyDescriptor, TypeDescriptor, Value,
};

use crate::cursor::ResultIter;
use crate::error::{DatastoreError, DatastoreResult};

/// A factory for sessions over one backend.
pub trait Datastore {
    type Session: DatastoreSession;

    /// Open a new session. Each session has its own transaction state.
    fn create_session(&self) -> DatastoreResult<Self::Session>;
}

/// Primitive operations over backend-native entity and relation handles.
///
/// All implementations must satisfy these invariants:
/// - Identities are stable for the lifetime of the record within a
///   transaction.
/// - Structural writes (create, delete, property writes, migration) fail
///   with [`DatastoreError::NoActiveTransaction`] when no transaction is
///   active.
/// - Reads observe the session's own uncommitted writes.
/// - A relation traversed in direction `From` yields the relations whose
///   `from` endpoint is the given entity; `To` yields those whose `to`
///   endpoint is.
pub trait DatastoreSession: 'static {
    type EntityId: Clone + Eq + Hash + Debug + Display + 'static;
    type RelationId: Clone + Eq + Hash + Debug + Display + 'static;
    type Entity: Clone + Debug + 'static;
    type Relation: Clone + Debug + 'static;

    // --- transactions ---

    /// Begin a (possibly nested) transaction.
    fn begin(&mut self) -> DatastoreResult<()>;

    /// Commit the innermost transaction.
    fn commit(&mut self) -> DatastoreResult<()>;

    /// Roll back the innermost transaction.
    fn rollback(&mut self) -> DatastoreResult<()>;

    fn is_active(&self) -> bool;

    // --- entities ---

    fn entity_id(&self, entity: &Self::Entity) -> Self::EntityId;

    /// The discriminators currently carried by an entity.
    fn entity_discriminators(
        &self,
        entity: &Self::Entity,
    ) -> DatastoreResult<BTreeSet<Discriminator>>;

    fn create_entity(
        &mut self,
        types: &CapabilitySet,
        discriminators: &BTreeSet<Discriminator>,
    ) -> DatastoreResult<Self::Entity>;

    fn delete_entity(&mut self, entity: &Self::Entity) -> DatastoreResult<()>;

    /// Find entities carrying `discriminator` whose `key` property equals
    /// `value`.
    fn find_entity(
        &self,
        ty: &TypeDescriptor,
        discriminator: &Discriminator,
        key: &PropertyDescriptor,
        value: &Value,
    ) -> DatastoreResult<ResultIter<Self::Entity>>;

    /// Replace the discriminators of an entity. Returns the handle to use
    /// from now on.
    fn migrate_entity(
        &mut self,
        entity: &Self::Entity,
        types: &CapabilitySet,
        discriminators: &BTreeSet<Discriminator>,
        target_types: &CapabilitySet,
        target_discriminators: &BTreeSet<Discriminator>,
    ) -> DatastoreResult<Self::Entity>;

    /// Write back any state buffered for the entity.
    fn flush_entity(&mut self, entity: &Self::Entity) -> DatastoreResult<()>;

    // --- properties ---

    fn entity_property(
        &self,
        entity: &Self::Entity,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<Option<Value>>;

    fn set_entity_property(
        &mut self,
        entity: &Self::Entity,
        key: &PropertyDescriptor,
        value: Value,
    ) -> DatastoreResult<()>;

    fn remove_entity_property(
        &mut self,
        entity: &Self::Entity,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<()>;

    fn relation_property(
        &self,
        relation: &Self::Relation,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<Option<Value>>;

    fn set_relation_property(
        &mut self,
        relation: &Self::Relation,
        key: &PropertyDescriptor,
        value: Value,
    ) -> DatastoreResult<()>;

    fn remove_relation_property(
        &mut self,
        relation: &Self::Relation,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<()>;

    // --- relations ---

    fn relation_id(&self, relation: &Self::Relation) -> Self::RelationId;

    fn relation_discriminator(&self, relation: &Self::Relation) -> DatastoreResult<Discriminator>;

    /// Create a relation between `source` and `target`. With `From` the
    /// source becomes the `from` endpoint, with `To` the `to` endpoint.
    fn create_relation(
        &mut self,
        source: &Self::Entity,
        relationship: &Discriminator,
        direction: Direction,
        target: &Self::Entity,
    ) -> DatastoreResult<Self::Relation>;

    fn delete_relation(&mut self, relation: &Self::Relation) -> DatastoreResult<()>;

    fn from_entity(&self, relation: &Self::Relation) -> DatastoreResult<Self::Entity>;

    fn to_entity(&self, relation: &Self::Relation) -> DatastoreResult<Self::Entity>;

    /// All relations of `relationship` attached to `entity` on the given side.
    fn relations(
        &self,
        entity: &Self::Entity,
        relationship: &Discriminator,
        direction: Direction,
    ) -> DatastoreResult<ResultIter<Self::Relation>>;

    /// The only matching relation, if any.
    ///
    /// Fails with [`DatastoreError::AmbiguousRelation`] when more than one
    /// relation matches. Backends with a native single-relation lookup may
    /// override this.
    fn single_relation(
        &self,
        entity: &Self::Entity,
        relationship: &Discriminator,
        direction: Direction,
    ) -> DatastoreResult<Option<Self::Relation>> {
        let mut relations = self.relations(entity, relationship, direction)?;
        let first = relations.next().transpose()?;
        if first.is_some() && relations.next().transpose()?.is_some() {
            return Err(DatastoreError::AmbiguousRelation {
                relationship: relationship.to_string(),
            });
        }
        Ok(first)
    }

    fn has_single_relation(
        &self,
        entity: &Self::Entity,
        relationship: &Discriminator,
        direction: Direction,
    ) -> DatastoreResult<bool> {
        Ok(self.single_relation(entity, relationship, direction)?.is_some())
    }

    /// The entity at the other end of `relation`, seen from the side
    /// `direction`.
    fn opposite_entity(
        &self,
        relation: &Self::Relation,
        direction: Direction,
    ) -> DatastoreResult<Self::Entity> {
        match direction {
            Direction::From => self.to_entity(relation),
            Direction::To => self.from_entity(relation),
        }
    }
}
