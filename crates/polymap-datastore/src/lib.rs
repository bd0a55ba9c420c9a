//! Datastore boundary for Polymap.
//!
//! The runtime never talks to a storage engine directly. It drives a
//! [`DatastoreSession`] that exposes primitive operations over
//! backend-native entity and relation handles: create, delete, find,
//! property access, relationship traversal and transaction demarcation.
//!
//! # Backends
//!
//! - [`InMemoryDatastore`] -- labelled property graph held in memory, for
//!   tests and embedding
//! - [`TracingDatastore`] -- decorator that logs every call of a wrapped
//!   backend at `trace` level
//!
//! # Design Rules
//!
//! 1. Handles are opaque to callers; only the runtime inspects them.
//! 2. Structural writes require an active transaction.
//! 3. Relationship reads return a [`ResultIter`] that releases its backend
//!    cursor on exhaustion, on error, on `close()` and on drop.
//! 4. All backend failures are propagated, never silently ignored.

pub mod cursor;
pub mod error;
pub mod memory;
pub mod trace;
pub mod traits;

pub use cursor::ResultIter;
pub use error::{DatastoreError, DatastoreResult};
pub use memory::{EdgeId, InMemoryDatastore, InMemorySession, MemoryEdge, MemoryNode, NodeId};
pub use trace::{TracingDatastore, TracingSession};
pub use traits::{Datastore, DatastoreSession};
