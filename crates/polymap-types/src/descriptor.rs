//! Type and accessor descriptors.
//!
//! Descriptors are immutable metadata produced outside the runtime (by hand,
//! by a derive layer, or loaded from JSON) and consumed by it. A
//! [`TypeDescriptor`] names an entity or relation type and lists the
//! accessors the type contributes to any instance whose capability set
//! contains it.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MetadataError;

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Name of a declared type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeName(String);

impl TypeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TypeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&TypeName> for TypeName {
    fn from(name: &TypeName) -> Self {
        name.clone()
    }
}

impl Borrow<str> for TypeName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Backend-level marker identifying a type (a node label, a document
/// collection) or a relationship kind (an edge type).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Discriminator(String);

impl Discriminator {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Discriminator {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Discriminator {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// The side of a relationship an accessor is declared on.
///
/// `From` accessors traverse outgoing relations and yield the relation's
/// `to` endpoint; `To` accessors traverse incoming relations and yield the
/// `from` endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Direction {
    From,
    To,
}

impl Direction {
    /// The direction seen from the other endpoint.
    pub fn opposite(self) -> Self {
        match self {
            Self::From => Self::To,
            Self::To => Self::From,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::From => "from",
            Self::To => "to",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "from" | "outgoing" => Ok(Self::From),
            "to" | "incoming" => Ok(Self::To),
            _ => Err(MetadataError::InvalidDirection(s.to_string())),
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = MetadataError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Direction> for String {
    fn from(d: Direction) -> Self {
        d.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// Accessor descriptors
// ---------------------------------------------------------------------------

/// A primitive property stored under a backend key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub key: String,
}

impl PropertyDescriptor {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// A relationship traversal from the declaring type to `target`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationDescriptor {
    /// Discriminator of the backend relationship.
    pub relationship: Discriminator,
    /// Side of the relationship the declaring type sits on.
    pub direction: Direction,
    /// Entity type expected at the other endpoint.
    pub target: TypeName,
}

impl RelationDescriptor {
    pub fn new(
        relationship: impl Into<Discriminator>,
        direction: Direction,
        target: impl Into<TypeName>,
    ) -> Self {
        Self {
            relationship: relationship.into(),
            direction,
            target: target.into(),
        }
    }
}

/// What an accessor does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessorKind {
    /// Read/write a primitive backend property.
    Primitive(PropertyDescriptor),
    /// Single-valued reference to the entity at the other end.
    EntityReference(RelationDescriptor),
    /// All entities at the other end.
    EntityCollection(RelationDescriptor),
    /// Single-valued reference to the relation itself (typed relations only).
    RelationReference(RelationDescriptor),
    /// All relations of this relationship (typed relations only).
    RelationCollection(RelationDescriptor),
    /// On a relation type: the `from` or `to` entity.
    Endpoint(Direction),
    /// Instance-local value, never written to the backend.
    Transient,
    /// Logic supplied by the caller under the given operation key.
    Implemented { operation: String },
}

impl AccessorKind {
    /// Dispatch precedence; lower wins when two accessors share a name.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Implemented { .. } => 0,
            Self::Primitive(_) => 1,
            Self::EntityReference(_) | Self::RelationReference(_) | Self::Endpoint(_) => 2,
            Self::EntityCollection(_) | Self::RelationCollection(_) => 3,
            Self::Transient => 4,
        }
    }

    /// The relation descriptor, for relationship-backed accessors.
    pub fn relation(&self) -> Option<&RelationDescriptor> {
        match self {
            Self::EntityReference(r)
            | Self::EntityCollection(r)
            | Self::RelationReference(r)
            | Self::RelationCollection(r) => Some(r),
            _ => None,
        }
    }

    /// Returns `true` for accessors holding at most one relation.
    pub fn is_single(&self) -> bool {
        matches!(self, Self::EntityReference(_) | Self::RelationReference(_))
    }

    /// Human-readable category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Primitive(_) => "primitive",
            Self::EntityReference(_) => "entity reference",
            Self::EntityCollection(_) => "entity collection",
            Self::RelationReference(_) => "relation reference",
            Self::RelationCollection(_) => "relation collection",
            Self::Endpoint(_) => "endpoint",
            Self::Transient => "transient",
            Self::Implemented { .. } => "implemented",
        }
    }
}

/// One named accessor contributed by a type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessorDescriptor {
    pub name: String,
    /// Filled in by the registry when loaded from JSON.
    #[serde(default)]
    pub declaring_type: TypeName,
    pub kind: AccessorKind,
}

// ---------------------------------------------------------------------------
// Type descriptors
// ---------------------------------------------------------------------------

/// Whether a type describes entities or relations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    #[default]
    Entity,
    Relation { relationship: Discriminator },
}

/// A declared entity or relation type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: TypeName,
    #[serde(default)]
    pub kind: TypeKind,
    /// Backend marker used to create and find records of this type.
    #[serde(default)]
    pub discriminator: Option<Discriminator>,
    #[serde(default)]
    pub supertypes: Vec<TypeName>,
    #[serde(default)]
    pub accessors: Vec<AccessorDescriptor>,
    /// Name of the primitive accessor used by `find`.
    #[serde(default)]
    pub indexed: Option<String>,
}

impl TypeDescriptor {
    /// An entity type whose discriminator equals its name.
    pub fn entity(name: impl Into<TypeName>) -> Self {
        let name = name.into();
        Self {
            discriminator: Some(Discriminator::new(name.as_str())),
            name,
            kind: TypeKind::Entity,
            supertypes: Vec::new(),
            accessors: Vec::new(),
            indexed: None,
        }
    }

    /// A relation type bound to a relationship discriminator.
    pub fn relation(name: impl Into<TypeName>, relationship: impl Into<Discriminator>) -> Self {
        let relationship = relationship.into();
        Self {
            name: name.into(),
            discriminator: Some(relationship.clone()),
            kind: TypeKind::Relation { relationship },
            supertypes: Vec::new(),
            accessors: Vec::new(),
            indexed: None,
        }
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.kind, TypeKind::Relation { .. })
    }

    pub fn with_discriminator(mut self, discriminator: impl Into<Discriminator>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }

    /// Abstract types carry no discriminator and cannot be looked up.
    pub fn without_discriminator(mut self) -> Self {
        self.discriminator = None;
        self
    }

    pub fn extends(mut self, supertype: impl Into<TypeName>) -> Self {
        self.supertypes.push(supertype.into());
        self
    }

    pub fn indexed(mut self, accessor: impl Into<String>) -> Self {
        self.indexed = Some(accessor.into());
        self
    }

    /// Add an accessor of the given kind.
    pub fn with(mut self, name: impl Into<String>, kind: AccessorKind) -> Self {
        self.accessors.push(AccessorDescriptor {
            name: name.into(),
            declaring_type: self.name.clone(),
            kind,
        });
        self
    }

    pub fn primitive(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let key = name.clone();
        self.with(name, AccessorKind::Primitive(PropertyDescriptor::new(key)))
    }

    pub fn transient(self, name: impl Into<String>) -> Self {
        self.with(name, AccessorKind::Transient)
    }

    pub fn implemented(self, name: impl Into<String>, operation: impl Into<String>) -> Self {
        self.with(
            name,
            AccessorKind::Implemented {
                operation: operation.into(),
            },
        )
    }

    pub fn reference(
        self,
        name: impl Into<String>,
        relationship: impl Into<Discriminator>,
        direction: Direction,
        target: impl Into<TypeName>,
    ) -> Self {
        let r = RelationDescriptor::new(relationship, direction, target);
        self.with(name, AccessorKind::EntityReference(r))
    }

    pub fn collection(
        self,
        name: impl Into<String>,
        relationship: impl Into<Discriminator>,
        direction: Direction,
        target: impl Into<TypeName>,
    ) -> Self {
        let r = RelationDescriptor::new(relationship, direction, target);
        self.with(name, AccessorKind::EntityCollection(r))
    }

    pub fn relation_reference(
        self,
        name: impl Into<String>,
        relationship: impl Into<Discriminator>,
        direction: Direction,
        target: impl Into<TypeName>,
    ) -> Self {
        let r = RelationDescriptor::new(relationship, direction, target);
        self.with(name, AccessorKind::RelationReference(r))
    }

    pub fn relation_collection(
        self,
        name: impl Into<String>,
        relationship: impl Into<Discriminator>,
        direction: Direction,
        target: impl Into<TypeName>,
    ) -> Self {
        let r = RelationDescriptor::new(relationship, direction, target);
        self.with(name, AccessorKind::RelationCollection(r))
    }

    pub fn endpoint(self, name: impl Into<String>, direction: Direction) -> Self {
        self.with(name, AccessorKind::Endpoint(direction))
    }

    /// Look up an accessor declared directly on this type.
    pub fn accessor(&self, name: &str) -> Option<&AccessorDescriptor> {
        self.accessors.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn direction_parses_aliases() {
        assert_eq!("from".parse::<Direction>().unwrap(), Direction::From);
        assert_eq!("Outgoing".parse::<Direction>().unwrap(), Direction::From);
        assert_eq!("INCOMING".parse::<Direction>().unwrap(), Direction::To);
        let err = "sideways".parse::<Direction>().unwrap_err();
        assert_eq!(err, MetadataError::InvalidDirection("sideways".into()));
    }

    #[test]
    fn invalid_direction_fails_deserialization() {
        let err = serde_json::from_str::<Direction>(r#""up""#).unwrap_err();
        assert!(err.to_string().contains("invalid direction"));
    }

    #[test]
    fn builder_records_declaring_type() {
        let ty = TypeDescriptor::entity("Person")
            .primitive("name")
            .reference("employer", "WORKS_FOR", Direction::From, "Company");
        assert_eq!(ty.discriminator, Some(Discriminator::new("Person")));
        let employer = ty.accessor("employer").unwrap();
        assert_eq!(employer.declaring_type, TypeName::new("Person"));
        assert!(employer.kind.is_single());
        assert_eq!(employer.kind.relation().unwrap().target, TypeName::new("Company"));
    }

    #[test]
    fn implemented_takes_precedence() {
        let implemented = AccessorKind::Implemented {
            operation: "op".into(),
        };
        let primitive = AccessorKind::Primitive(PropertyDescriptor::new("k"));
        assert!(implemented.precedence() < primitive.precedence());
        assert!(primitive.precedence() < AccessorKind::Transient.precedence());
    }

    #[test]
    fn relation_type_uses_relationship_as_discriminator() {
        let ty = TypeDescriptor::relation("Employment", "WORKS_FOR")
            .endpoint("employee", Direction::From);
        assert!(ty.is_relation());
        assert_eq!(ty.discriminator, Some(Discriminator::new("WORKS_FOR")));
    }

    proptest! {
        #[test]
        fn opposite_is_an_involution(from in any::<bool>()) {
            let d = if from { Direction::From } else { Direction::To };
            prop_assert_eq!(d.opposite().opposite(), d);
            prop_assert_ne!(d.opposite(), d);
            prop_assert_eq!(d.as_str().parse::<Direction>().unwrap(), d);
        }
    }
}
