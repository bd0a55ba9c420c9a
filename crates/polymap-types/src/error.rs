use thiserror::Error;

/// Errors produced while loading or resolving type metadata.
///
/// All of these describe a broken type configuration. They are raised when
/// the metadata is loaded or first resolved and are not meant to be
/// recovered from at runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("duplicate type: {0}")]
    DuplicateType(String),

    #[error("discriminator '{discriminator}' is declared by both {first} and {second}")]
    DuplicateDiscriminator {
        discriminator: String,
        first: String,
        second: String,
    },

    #[error("invalid direction '{0}': expected 'from' or 'to'")]
    InvalidDirection(String),

    #[error("type {ty} declares unknown supertype {supertype}")]
    UnknownSupertype { ty: String, supertype: String },

    #[error("supertype cycle through {0}")]
    SupertypeCycle(String),

    #[error("accessor {ty}.{accessor}: {reason}")]
    InvalidAccessor {
        ty: String,
        accessor: String,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MetadataError {
    /// Create an accessor error for the given type and accessor name.
    pub fn accessor(
        ty: impl Into<String>,
        accessor: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidAccessor {
            ty: ty.into(),
            accessor: accessor.into(),
            reason: reason.into(),
        }
    }
}
