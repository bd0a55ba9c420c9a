/// Errors raised by datastore sessions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatastoreError {
    /// A write or a commit/rollback was attempted outside a transaction.
    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("relation not found: {0}")]
    RelationNotFound(String),

    /// The entity is still attached to relations and cannot be deleted.
    #[error("entity {id} still has {count} relation(s)")]
    EntityHasRelations { id: String, count: usize },

    /// More than one relation matched a single-valued traversal.
    #[error("more than one relation of type {relationship}")]
    AmbiguousRelation { relationship: String },

    /// Failure reported by the storage engine.
    #[error("I/O error: {0}")]
    Io(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Result alias for datastore operations.
pub type DatastoreResult<T> = Result<T, DatastoreError>;
