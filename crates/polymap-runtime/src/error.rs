use polymap_datastore::DatastoreError;
use polymap_types::MetadataError;
use thiserror::Error;

/// Errors surfaced by the runtime.
///
/// None of these are retried internally. An error aborts the enclosing unit
/// of work only when the transaction guard started that unit.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    /// The instance was closed (explicitly, by eviction, or at scope end).
    #[error("instance {identity} is closed")]
    ClosedInstance { identity: String },

    /// No handler resolves the call, or the resolved handler rejects it.
    #[error("unsupported operation: {call}")]
    UnsupportedOperation { call: String },

    /// A single-valued traversal matched more than one relation.
    #[error("more than one relation of type {relationship}")]
    AmbiguousRelation { relationship: String },

    #[error("no transaction: {0}")]
    NoTransaction(String),

    /// The instance is not managed by this session.
    #[error("not managed: {0}")]
    NotManaged(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("invalid migration: {0}")]
    InvalidMigration(String),

    #[error("expected {expected} reply, found {found}")]
    UnexpectedReply {
        expected: &'static str,
        found: &'static str,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("datastore error: {0}")]
    Datastore(DatastoreError),

    /// Raised by caller-supplied operations, transfers and listeners.
    #[error("{0}")]
    Custom(String),
}

impl RuntimeError {
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }
}

impl From<DatastoreError> for RuntimeError {
    fn from(e: DatastoreError) -> Self {
        match e {
            DatastoreError::AmbiguousRelation { relationship } => {
                Self::AmbiguousRelation { relationship }
            }
            other => Self::Datastore(other),
        }
    }
}

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
