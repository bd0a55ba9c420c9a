//! The [`MetadataProvider`] boundary and its in-memory implementation.
//!
//! The runtime never inspects type definitions itself. Everything it needs
//! (accessors of a capability set, discriminators to write to the backend,
//! the capability set matching a record's discriminators) comes through
//! this trait.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::capability::CapabilitySet;
use crate::descriptor::{
    AccessorDescriptor, AccessorKind, Direction, Discriminator, TypeDescriptor, TypeKind, TypeName,
};
use crate::error::MetadataError;

/// Source of type metadata for the runtime.
///
/// Implementations must be immutable once handed to a session factory;
/// the runtime caches dispatch tables derived from them.
pub trait MetadataProvider {
    /// Look up a declared type by name.
    fn type_descriptor(&self, name: &str) -> Option<&TypeDescriptor>;

    /// Names of every declared type.
    fn type_names(&self) -> Vec<TypeName>;

    /// The relation type bound to a relationship discriminator, if any.
    fn relation_type(&self, relationship: &Discriminator) -> Option<&TypeDescriptor>;

    /// Map backend discriminators back to the most specific declared types.
    fn types_for(&self, discriminators: &BTreeSet<Discriminator>) -> CapabilitySet;

    /// The types of a capability set together with all their supertypes.
    ///
    /// Each type appears once, subtypes before their supertypes.
    fn effective_types(
        &self,
        capabilities: &CapabilitySet,
    ) -> Result<Vec<&TypeDescriptor>, MetadataError> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&TypeName> = capabilities.iter().collect();
        let mut types = Vec::new();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let ty = self
                .type_descriptor(name.as_str())
                .ok_or_else(|| MetadataError::UnknownType(name.to_string()))?;
            queue.extend(ty.supertypes.iter());
            types.push(ty);
        }
        Ok(types)
    }

    /// Every accessor an instance of the capability set can reach.
    fn accessors(
        &self,
        capabilities: &CapabilitySet,
    ) -> Result<Vec<&AccessorDescriptor>, MetadataError> {
        Ok(self
            .effective_types(capabilities)?
            .into_iter()
            .flat_map(|ty| ty.accessors.iter())
            .collect())
    }

    /// The discriminators a record of the capability set carries.
    fn discriminators(
        &self,
        capabilities: &CapabilitySet,
    ) -> Result<BTreeSet<Discriminator>, MetadataError> {
        Ok(self
            .effective_types(capabilities)?
            .into_iter()
            .filter_map(|ty| ty.discriminator.clone())
            .collect())
    }

    /// Look up an accessor by name within a capability set.
    fn accessor(
        &self,
        capabilities: &CapabilitySet,
        name: &str,
    ) -> Result<Option<&AccessorDescriptor>, MetadataError> {
        Ok(self
            .accessors(capabilities)?
            .into_iter()
            .filter(|a| a.name == name)
            .min_by_key(|a| a.kind.precedence()))
    }

    /// Find the relationship-backed accessor a capability set declares for
    /// one side of a relationship.
    fn relation_accessor(
        &self,
        capabilities: &CapabilitySet,
        relationship: &Discriminator,
        direction: Direction,
    ) -> Result<Option<&AccessorDescriptor>, MetadataError> {
        Ok(self
            .accessors(capabilities)?
            .into_iter()
            .filter(|a| {
                a.kind
                    .relation()
                    .is_some_and(|r| &r.relationship == relationship && r.direction == direction)
            })
            .min_by_key(|a| if a.kind.is_single() { 0 } else { 1 }))
    }
}

/// A validated, immutable set of type descriptors.
#[derive(Clone, Debug, Default)]
pub struct MetadataRegistry {
    types: BTreeMap<TypeName, TypeDescriptor>,
    by_discriminator: BTreeMap<Discriminator, TypeName>,
    relation_types: BTreeMap<Discriminator, TypeName>,
}

impl MetadataRegistry {
    /// Build a registry, validating the whole type configuration.
    pub fn new(
        descriptors: impl IntoIterator<Item = TypeDescriptor>,
    ) -> Result<Self, MetadataError> {
        let mut registry = Self::default();
        for mut ty in descriptors {
            for accessor in &mut ty.accessors {
                accessor.declaring_type = ty.name.clone();
            }
            if registry.types.contains_key(&ty.name) {
                return Err(MetadataError::DuplicateType(ty.name.to_string()));
            }
            if let Some(d) = &ty.discriminator {
                let index = match ty.kind {
                    TypeKind::Entity => &mut registry.by_discriminator,
                    TypeKind::Relation { .. } => &mut registry.relation_types,
                };
                if let Some(first) = index.get(d) {
                    return Err(MetadataError::DuplicateDiscriminator {
                        discriminator: d.to_string(),
                        first: first.to_string(),
                        second: ty.name.to_string(),
                    });
                }
                index.insert(d.clone(), ty.name.clone());
            }
            if let TypeKind::Relation { relationship } = &ty.kind {
                registry
                    .relation_types
                    .entry(relationship.clone())
                    .or_insert_with(|| ty.name.clone());
            }
            registry.types.insert(ty.name.clone(), ty);
        }
        registry.validate()?;
        Ok(registry)
    }

    /// Load descriptors from a JSON array.
    pub fn from_json(json: &str) -> Result<Self, MetadataError> {
        let descriptors: Vec<TypeDescriptor> =
            serde_json::from_str(json).map_err(|e| MetadataError::Serialization(e.to_string()))?;
        Self::new(descriptors)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn validate(&self) -> Result<(), MetadataError> {
        for ty in self.types.values() {
            for supertype in &ty.supertypes {
                if !self.types.contains_key(supertype) {
                    return Err(MetadataError::UnknownSupertype {
                        ty: ty.name.to_string(),
                        supertype: supertype.to_string(),
                    });
                }
            }
        }
        for name in self.types.keys() {
            self.check_acyclic(name, &mut Vec::new())?;
        }
        for ty in self.types.values() {
            for accessor in &ty.accessors {
                self.validate_accessor(ty, accessor)?;
            }
            if let Some(indexed) = &ty.indexed {
                let caps = CapabilitySet::of([ty.name.clone()]);
                match self.accessor(&caps, indexed)? {
                    Some(a) if matches!(a.kind, AccessorKind::Primitive(_)) => {}
                    _ => {
                        return Err(MetadataError::accessor(
                            ty.name.as_str(),
                            indexed.as_str(),
                            "indexed accessor must be a primitive property",
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    fn check_acyclic<'a>(
        &'a self,
        name: &'a TypeName,
        path: &mut Vec<&'a TypeName>,
    ) -> Result<(), MetadataError> {
        if path.contains(&name) {
            return Err(MetadataError::SupertypeCycle(name.to_string()));
        }
        path.push(name);
        if let Some(ty) = self.types.get(name) {
            for supertype in &ty.supertypes {
                self.check_acyclic(supertype, path)?;
            }
        }
        path.pop();
        Ok(())
    }

    fn validate_accessor(
        &self,
        ty: &TypeDescriptor,
        accessor: &AccessorDescriptor,
    ) -> Result<(), MetadataError> {
        let fail = |reason: &str| {
            MetadataError::accessor(ty.name.as_str(), accessor.name.as_str(), reason)
        };
        if let Some(relation) = accessor.kind.relation() {
            if ty.is_relation() {
                return Err(fail("relation types cannot declare relationship accessors"));
            }
            match self.types.get(&relation.target) {
                Some(target) if !target.is_relation() => {}
                Some(_) => return Err(fail("target must be an entity type")),
                None => return Err(MetadataError::UnknownType(relation.target.to_string())),
            }
        }
        match &accessor.kind {
            AccessorKind::RelationReference(r) | AccessorKind::RelationCollection(r)
                if !self.relation_types.contains_key(&r.relationship) =>
            {
                Err(fail(&format!("relationship '{}' has no relation type", r.relationship)))
            }
            AccessorKind::Endpoint(_) if !ty.is_relation() => {
                Err(fail("endpoints are only valid on relation types"))
            }
            AccessorKind::Implemented { operation } if operation.is_empty() => {
                Err(fail("operation key is empty"))
            }
            _ => Ok(()),
        }
    }

    fn is_subtype_of(&self, ty: &TypeName, ancestor: &TypeName) -> bool {
        let Some(descriptor) = self.types.get(ty) else {
            return false;
        };
        descriptor
            .supertypes
            .iter()
            .any(|s| s == ancestor || self.is_subtype_of(s, ancestor))
    }
}

impl MetadataProvider for MetadataRegistry {
    fn type_descriptor(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    fn type_names(&self) -> Vec<TypeName> {
        self.types.keys().cloned().collect()
    }

    fn relation_type(&self, relationship: &Discriminator) -> Option<&TypeDescriptor> {
        self.relation_types.get(relationship).and_then(|name| self.types.get(name))
    }

    fn types_for(&self, discriminators: &BTreeSet<Discriminator>) -> CapabilitySet {
        let matched: Vec<&TypeName> = discriminators
            .iter()
            .filter_map(|d| self.by_discriminator.get(d))
            .collect();
        matched
            .iter()
            .filter(|candidate| !matched.iter().any(|other| self.is_subtype_of(other, candidate)))
            .map(|name| (*name).clone())
            .collect()
    }
}
