//! Property and relation translation.
//!
//! Maps accessor semantics onto primitive datastore calls. Absent values are
//! not errors, writing `Value::Null` removes a property, and
//! single-valued relation writes replace any existing relation.

use std::rc::Rc;

use polymap_datastore::{DatastoreResult, DatastoreSession, ResultIter};
use polymap_types::{Direction, PropertyDescriptor, RelationDescriptor, Value};

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::{Handle, Instance, InstanceSeq, RecordId};
use crate::session::SessionContext;

pub(crate) struct Translator<'a, S: DatastoreSession> {
    context: &'a Rc<SessionContext<S>>,
}

impl<'a, S: DatastoreSession> Translator<'a, S> {
    pub(crate) fn new(context: &'a Rc<SessionContext<S>>) -> Self {
        Self { context }
    }

    // --- primitives ---

    pub(crate) fn read_primitive(
        &self,
        handle: &Handle<S>,
        key: &PropertyDescriptor,
    ) -> RuntimeResult<Option<Value>> {
        let datastore = self.context.datastore.borrow();
        Ok(match handle {
            Handle::Entity(e) => datastore.entity_property(e, key)?,
            Handle::Relation(r) => datastore.relation_property(r, key)?,
        })
    }

    pub(crate) fn write_primitive(
        &self,
        handle: &Handle<S>,
        key: &PropertyDescriptor,
        value: Value,
    ) -> RuntimeResult<()> {
        if value.is_null() {
            return self.remove_primitive(handle, key);
        }
        {
            let mut datastore = self.context.datastore.borrow_mut();
            match handle {
                Handle::Entity(e) => datastore.set_entity_property(e, key, value)?,
                Handle::Relation(r) => datastore.set_relation_property(r, key, value)?,
            }
        }
        self.context.touch(handle);
        Ok(())
    }

    pub(crate) fn remove_primitive(
        &self,
        handle: &Handle<S>,
        key: &PropertyDescriptor,
    ) -> RuntimeResult<()> {
        {
            let mut datastore = self.context.datastore.borrow_mut();
            match handle {
                Handle::Entity(e) => datastore.remove_entity_property(e, key)?,
                Handle::Relation(r) => datastore.remove_relation_property(r, key)?,
            }
        }
        self.context.touch(handle);
        Ok(())
    }

    // --- single-valued relations ---

    pub(crate) fn read_single_relation(
        &self,
        entity: &S::Entity,
        rel: &RelationDescriptor,
    ) -> RuntimeResult<Option<S::Relation>> {
        Ok(self
            .context
            .datastore
            .borrow()
            .single_relation(entity, &rel.relationship, rel.direction)?)
    }

    pub(crate) fn entity_reference(
        &self,
        instance: &Instance<S>,
        rel: &RelationDescriptor,
    ) -> RuntimeResult<Option<Instance<S>>> {
        let entity = entity_of(instance)?;
        let Some(relation) = self.read_single_relation(&entity, rel)? else {
            return Ok(None);
        };
        let target = self
            .context
            .datastore
            .borrow()
            .opposite_entity(&relation, rel.direction)?;
        self.context.entity_instance(target).map(Some)
    }

    pub(crate) fn relation_reference(
        &self,
        instance: &Instance<S>,
        rel: &RelationDescriptor,
    ) -> RuntimeResult<Option<Instance<S>>> {
        let entity = entity_of(instance)?;
        match self.read_single_relation(&entity, rel)? {
            Some(relation) => self.context.relation_instance(relation).map(Some),
            None => Ok(None),
        }
    }

    /// The `from` or `to` entity of a relation instance.
    pub(crate) fn endpoint(
        &self,
        instance: &Instance<S>,
        direction: Direction,
    ) -> RuntimeResult<Instance<S>> {
        let Handle::Relation(relation) = instance.handle() else {
            return Err(RuntimeError::UnsupportedOperation {
                call: format!("endpoint of entity {}", instance.id()),
            });
        };
        let entity = {
            let datastore = self.context.datastore.borrow();
            match direction {
                Direction::From => datastore.from_entity(&relation)?,
                Direction::To => datastore.to_entity(&relation)?,
            }
        };
        self.context.entity_instance(entity)
    }

    /// Point a single-valued reference at `target`, or clear it.
    pub(crate) fn set_reference(
        &self,
        source: &Instance<S>,
        rel: &RelationDescriptor,
        target: Option<&Instance<S>>,
    ) -> RuntimeResult<()> {
        match target {
            Some(target) => self.create_relation(source, rel, target, true).map(drop),
            None => {
                let entity = entity_of(source)?;
                if let Some(existing) = self.read_single_relation(&entity, rel)? {
                    self.remove_relation(&existing)?;
                }
                Ok(())
            }
        }
    }

    // --- sequences ---

    pub(crate) fn read_relation_sequence(
        &self,
        entity: &S::Entity,
        rel: &RelationDescriptor,
    ) -> RuntimeResult<ResultIter<S::Relation>> {
        Ok(self
            .context
            .datastore
            .borrow()
            .relations(entity, &rel.relationship, rel.direction)?)
    }

    /// Entities at the other end of every matching relation.
    pub(crate) fn entity_sequence(
        &self,
        instance: &Instance<S>,
        rel: &RelationDescriptor,
    ) -> RuntimeResult<InstanceSeq<S>> {
        let entity = entity_of(instance)?;
        let cursor = self.read_relation_sequence(&entity, rel)?;
        let context = Rc::clone(self.context);
        let direction = rel.direction;
        Ok(InstanceSeq::new(cursor.map(move |relation| -> RuntimeResult<Instance<S>> {
            let target = context.datastore.borrow().opposite_entity(&relation, direction)?;
            context.entity_instance(target)
        })))
    }

    /// Relation instances for every matching relation.
    pub(crate) fn relation_sequence(
        &self,
        instance: &Instance<S>,
        rel: &RelationDescriptor,
    ) -> RuntimeResult<InstanceSeq<S>> {
        let entity = entity_of(instance)?;
        let cursor = self.read_relation_sequence(&entity, rel)?;
        let context = Rc::clone(self.context);
        Ok(InstanceSeq::new(
            cursor.map(move |relation| context.relation_instance(relation)),
        ))
    }

    // --- relation writes ---

    /// Create a relation from `source` to `target` on the side described by
    /// `rel`. With `single` set, an existing relation is deleted first.
    pub(crate) fn create_relation(
        &self,
        source: &Instance<S>,
        rel: &RelationDescriptor,
        target: &Instance<S>,
        single: bool,
    ) -> RuntimeResult<S::Relation> {
        self.context.ensure_managed(target)?;
        let from = entity_of(source)?;
        let to = entity_of(target)?;
        if single {
            if let Some(existing) = self.read_single_relation(&from, rel)? {
                self.remove_relation(&existing)?;
            }
        }
        let relation = self
            .context
            .datastore
            .borrow_mut()
            .create_relation(&from, &rel.relationship, rel.direction, &to)?;
        self.context.refresh(&Handle::Entity(from));
        self.context.refresh(&Handle::Entity(to));
        let id = self.context.datastore.borrow().relation_id(&relation);
        self.context.track_volatile(RecordId::Relation(id));
        Ok(relation)
    }

    /// Delete a relation and retire any instance bound to it.
    pub(crate) fn remove_relation(&self, relation: &S::Relation) -> RuntimeResult<()> {
        let (id, from, to) = {
            let datastore = self.context.datastore.borrow();
            (
                datastore.relation_id(relation),
                datastore.from_entity(relation)?,
                datastore.to_entity(relation)?,
            )
        };
        self.context.datastore.borrow_mut().delete_relation(relation)?;
        self.context.refresh(&Handle::Entity(from));
        self.context.refresh(&Handle::Entity(to));
        self.context.retire(&RecordId::Relation(id));
        Ok(())
    }

    /// Remove one relation to `target`. Returns whether one was found.
    pub(crate) fn remove_from_collection(
        &self,
        source: &Instance<S>,
        rel: &RelationDescriptor,
        target: &Instance<S>,
    ) -> RuntimeResult<bool> {
        let RecordId::Entity(target_id) = target.id() else {
            return Ok(false);
        };
        let entity = entity_of(source)?;
        let relations: Vec<S::Relation> = self
            .read_relation_sequence(&entity, rel)?
            .collect::<DatastoreResult<_>>()?;
        for relation in relations {
            let matches = {
                let datastore = self.context.datastore.borrow();
                let other = datastore.opposite_entity(&relation, rel.direction)?;
                &datastore.entity_id(&other) == target_id
            };
            if matches {
                self.remove_relation(&relation)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Delete every matching relation. Returns how many were deleted.
    pub(crate) fn clear_collection(
        &self,
        source: &Instance<S>,
        rel: &RelationDescriptor,
    ) -> RuntimeResult<usize> {
        let entity = entity_of(source)?;
        let relations: Vec<S::Relation> = self
            .read_relation_sequence(&entity, rel)?
            .collect::<DatastoreResult<_>>()?;
        for relation in &relations {
            self.remove_relation(relation)?;
        }
        Ok(relations.len())
    }
}

/// The entity handle of an instance; relationship traversal is only defined
/// on entities.
pub(crate) fn entity_of<S: DatastoreSession>(instance: &Instance<S>) -> RuntimeResult<S::Entity> {
    match instance.handle() {
        Handle::Entity(entity) => Ok(entity),
        Handle::Relation(_) => Err(RuntimeError::UnsupportedOperation {
            call: format!("relationship traversal on relation {}", instance.id()),
        }),
    }
}
