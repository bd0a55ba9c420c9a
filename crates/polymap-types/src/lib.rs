//! Foundation types for Polymap.
//!
//! This crate provides the vocabulary shared by every other Polymap crate:
//! the primitive [`Value`] stored in backend properties, the descriptors that
//! describe one accessor of a type, the [`CapabilitySet`] assigned to a
//! record, and the [`MetadataProvider`] boundary through which the runtime
//! learns about declared types.
//!
//! # Key Types
//!
//! - [`Value`]: Primitive property value (absent values are [`Value::Null`])
//! - [`TypeName`] / [`Discriminator`]: Type identity and its backend marker
//! - [`Direction`]: FROM/TO side of a relationship
//! - [`AccessorDescriptor`] / [`AccessorKind`]: One accessor of a type
//! - [`TypeDescriptor`]: An entity or relation type with its accessors
//! - [`CapabilitySet`]: Order-irrelevant set of type names
//! - [`MetadataRegistry`]: Validated in-memory [`MetadataProvider`]

pub mod capability;
pub mod descriptor;
pub mod error;
pub mod metadata;
pub mod value;

pub use capability::CapabilitySet;
pub use descriptor::{
    AccessorDescriptor, AccessorKind, Direction, Discriminator, PropertyDescriptor,
    RelationDescriptor, TypeDescriptor, TypeKind, TypeName,
};
pub use error::MetadataError;
pub use metadata::{MetadataProvider, MetadataRegistry};
pub use value::Value;
