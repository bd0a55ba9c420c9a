//! Units of work.
//!
//! A session tracks a stack of units of work, each begun either explicitly
//! by the caller through [`Transaction`] or implicitly by the
//! [`TransactionGuard`] around a structural call. Commit and rollback must
//! target the innermost unit and be issued by whoever began it.

use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use polymap_datastore::DatastoreSession;
use tracing::{debug, warn};

use crate::config::{CacheScope, TransactionAttribute};
use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::RecordId;
use crate::session::SessionContext;

/// Who began a unit of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnitOrigin {
    Explicit,
    Guard,
}

/// One active unit of work.
///
/// `volatile` holds the records created or migrated inside the unit. Their
/// cached instances describe state that a rollback discards.
pub(crate) struct UnitFrame<S: DatastoreSession> {
    origin: UnitOrigin,
    volatile: HashSet<RecordId<S>>,
}

impl<S: DatastoreSession> UnitFrame<S> {
    fn new(origin: UnitOrigin) -> Self {
        Self {
            origin,
            volatile: HashSet::new(),
        }
    }
}

impl<S: DatastoreSession> SessionContext<S> {
    pub(crate) fn is_active(&self) -> bool {
        !self.frames.borrow().is_empty()
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub(crate) fn innermost_origin(&self) -> Option<UnitOrigin> {
        self.frames.borrow().last().map(|frame| frame.origin)
    }

    /// Remember that the innermost unit created or migrated `id`.
    pub(crate) fn track_volatile(&self, id: RecordId<S>) {
        if let Some(frame) = self.frames.borrow_mut().last_mut() {
            frame.volatile.insert(id);
        }
    }

    pub(crate) fn begin_unit(&self, origin: UnitOrigin) -> RuntimeResult<()> {
        self.ensure_open()?;
        self.datastore.borrow_mut().begin()?;
        let depth = {
            let mut frames = self.frames.borrow_mut();
            frames.push(UnitFrame::new(origin));
            frames.len()
        };
        debug!(session = %self.id, ?origin, depth, "unit of work begun");
        Ok(())
    }

    fn ensure_innermost(&self, origin: UnitOrigin, op: &str) -> RuntimeResult<()> {
        match self.innermost_origin() {
            Some(top) if top == origin => Ok(()),
            Some(top) => Err(RuntimeError::NoTransaction(format!(
                "cannot {op}: innermost unit of work was begun by {top:?}, not {origin:?}"
            ))),
            None => Err(RuntimeError::NoTransaction(format!(
                "cannot {op}: no active unit of work"
            ))),
        }
    }

    /// Flush dirty entities, then commit the innermost unit. A nested commit
    /// hands its volatile records to the enclosing unit.
    pub(crate) fn commit_unit(&self, origin: UnitOrigin) -> RuntimeResult<()> {
        self.ensure_innermost(origin, "commit")?;
        self.flush_dirty()?;
        self.datastore.borrow_mut().commit()?;
        let depth = {
            let mut frames = self.frames.borrow_mut();
            if let Some(frame) = frames.pop() {
                if let Some(parent) = frames.last_mut() {
                    parent.volatile.extend(frame.volatile);
                }
            }
            frames.len()
        };
        debug!(session = %self.id, ?origin, depth, "unit of work committed");
        if depth == 0
            && origin == UnitOrigin::Explicit
            && self.config.cache_scope == CacheScope::Transaction
        {
            self.clear_caches();
        }
        Ok(())
    }

    /// Roll back the innermost unit and close every instance of a record it
    /// created or migrated. An outermost explicit rollback clears the
    /// caches in every scope.
    pub(crate) fn rollback_unit(&self, origin: UnitOrigin) -> RuntimeResult<()> {
        self.ensure_innermost(origin, "rollback")?;
        self.datastore.borrow_mut().rollback()?;
        let (frame, depth) = {
            let mut frames = self.frames.borrow_mut();
            let frame = frames.pop();
            (frame, frames.len())
        };
        let retired = frame.map_or(0, |frame| {
            let count = frame.volatile.len();
            for id in &frame.volatile {
                self.discard(id);
            }
            count
        });
        debug!(session = %self.id, ?origin, depth, retired, "unit of work rolled back");
        if depth == 0 && origin == UnitOrigin::Explicit {
            self.dirty.borrow_mut().clear();
            self.clear_caches();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Wraps structural calls in a unit of work according to a
/// [`TransactionAttribute`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionGuard {
    attribute: TransactionAttribute,
}

impl TransactionGuard {
    pub fn new(attribute: TransactionAttribute) -> Self {
        Self { attribute }
    }

    pub fn attribute(&self) -> TransactionAttribute {
        self.attribute
    }

    /// Run `op` under the guard.
    ///
    /// If the guard began the unit of work it commits on success and rolls
    /// back on failure. The failure of `op` is returned unchanged.
    pub(crate) fn run<S: DatastoreSession, T>(
        &self,
        context: &SessionContext<S>,
        op: impl FnOnce() -> RuntimeResult<T>,
    ) -> RuntimeResult<T> {
        let starts = match self.attribute {
            TransactionAttribute::Mandatory if !context.is_active() => {
                return Err(RuntimeError::NoTransaction(
                    "operation requires an active transaction".into(),
                ));
            }
            TransactionAttribute::Mandatory => false,
            TransactionAttribute::Required => !context.is_active(),
            TransactionAttribute::RequiresNew => true,
        };
        if !starts {
            return op();
        }

        context.begin_unit(UnitOrigin::Guard)?;
        let result = op().and_then(|value| context.commit_unit(UnitOrigin::Guard).map(|()| value));
        if let Err(e) = &result {
            if context.innermost_origin() == Some(UnitOrigin::Guard) {
                if let Err(rollback) = context.rollback_unit(UnitOrigin::Guard) {
                    warn!(session = %context.id, error = %e, %rollback, "guard rollback failed");
                }
            }
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Explicit transactions
// ---------------------------------------------------------------------------

/// Caller-side handle on the session's units of work.
pub struct Transaction<S: DatastoreSession> {
    context: Rc<SessionContext<S>>,
}

impl<S: DatastoreSession> Transaction<S> {
    pub(crate) fn new(context: Rc<SessionContext<S>>) -> Self {
        Self { context }
    }

    /// Begin a unit of work, nested if one is already active.
    pub fn begin(&self) -> RuntimeResult<()> {
        self.context.begin_unit(UnitOrigin::Explicit)
    }

    /// Flush dirty entities and commit the innermost unit of work.
    ///
    /// Fails with `NoTransaction` when no unit of work begun by the caller
    /// is innermost, including on a second commit of the same unit.
    pub fn commit(&self) -> RuntimeResult<()> {
        self.context.commit_unit(UnitOrigin::Explicit)
    }

    pub fn rollback(&self) -> RuntimeResult<()> {
        self.context.rollback_unit(UnitOrigin::Explicit)
    }

    pub fn is_active(&self) -> bool {
        self.context.is_active()
    }

    /// Number of nested units of work currently active.
    pub fn depth(&self) -> usize {
        self.context.depth()
    }
}

impl<S: DatastoreSession> fmt::Debug for Transaction<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("session", &self.context.id)
            .field("depth", &self.depth())
            .finish()
    }
}
