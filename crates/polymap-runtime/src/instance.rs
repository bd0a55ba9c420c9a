//! Caller-visible instances.
//!
//! An [`Instance`] is bound to one record identity and one backend handle
//! at a time. Its usable accessors are exactly those of its capability set,
//! resolved once into a shared [`DispatchTable`]. Instances are `!Send`:
//! they belong to the session that produced them.

use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use polymap_datastore::{DatastoreSession, ResultIter};
use polymap_types::{CapabilitySet, Value};

use crate::dispatch::{Call, DispatchTable, Reply};
use crate::error::{RuntimeError, RuntimeResult};
use crate::session::SessionContext;

// ---------------------------------------------------------------------------
// Handles and identities
// ---------------------------------------------------------------------------

/// The backend-native record an instance is bound to.
pub enum Handle<S: DatastoreSession> {
    Entity(S::Entity),
    Relation(S::Relation),
}

impl<S: DatastoreSession> Clone for Handle<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Entity(e) => Self::Entity(e.clone()),
            Self::Relation(r) => Self::Relation(r.clone()),
        }
    }
}

impl<S: DatastoreSession> fmt::Debug for Handle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(e) => f.debug_tuple("Entity").field(e).finish(),
            Self::Relation(r) => f.debug_tuple("Relation").field(r).finish(),
        }
    }
}

/// Identity of an entity or relation record.
pub enum RecordId<S: DatastoreSession> {
    Entity(S::EntityId),
    Relation(S::RelationId),
}

impl<S: DatastoreSession> Clone for RecordId<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Entity(id) => Self::Entity(id.clone()),
            Self::Relation(id) => Self::Relation(id.clone()),
        }
    }
}

impl<S: DatastoreSession> PartialEq for RecordId<S> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Entity(a), Self::Entity(b)) => a == b,
            (Self::Relation(a), Self::Relation(b)) => a == b,
            _ => false,
        }
    }
}

impl<S: DatastoreSession> Eq for RecordId<S> {}

impl<S: DatastoreSession> Hash for RecordId<S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Entity(id) => {
                0u8.hash(state);
                id.hash(state);
            }
            Self::Relation(id) => {
                1u8.hash(state);
                id.hash(state);
            }
        }
    }
}

impl<S: DatastoreSession> fmt::Debug for RecordId<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(id) => f.debug_tuple("Entity").field(id).finish(),
            Self::Relation(id) => f.debug_tuple("Relation").field(id).finish(),
        }
    }
}

impl<S: DatastoreSession> fmt::Display for RecordId<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(id) => write!(f, "{id}"),
            Self::Relation(id) => write!(f, "{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

struct InstanceState<S: DatastoreSession> {
    id: RecordId<S>,
    handle: RefCell<Handle<S>>,
    capabilities: CapabilitySet,
    table: Rc<DispatchTable<S>>,
    transient: RefCell<HashMap<String, Value>>,
    closed: Cell<bool>,
    context: Weak<SessionContext<S>>,
}

/// A polymorphic view of one backend record.
///
/// Cloning an instance yields another reference to the same object. Two
/// instances compare equal when they have the same identity within the same
/// session; use [`is_same`](Self::is_same) for reference equality.
pub struct Instance<S: DatastoreSession> {
    state: Rc<InstanceState<S>>,
}

impl<S: DatastoreSession> Instance<S> {
    pub(crate) fn new(
        id: RecordId<S>,
        handle: Handle<S>,
        capabilities: CapabilitySet,
        table: Rc<DispatchTable<S>>,
        context: Weak<SessionContext<S>>,
    ) -> Self {
        Self {
            state: Rc::new(InstanceState {
                id,
                handle: RefCell::new(handle),
                capabilities,
                table,
                transient: RefCell::new(HashMap::new()),
                closed: Cell::new(false),
                context,
            }),
        }
    }

    pub fn id(&self) -> &RecordId<S> {
        &self.state.id
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.state.capabilities
    }

    pub fn is_entity(&self) -> bool {
        matches!(self.state.id, RecordId::Entity(_))
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.state.id, RecordId::Relation(_))
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    /// Reference equality.
    pub fn is_same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    /// Whether the capability set provides an accessor with this name.
    pub fn has_accessor(&self, name: &str) -> bool {
        self.state.table.resolve(name).is_some()
    }

    /// Route a call through the dispatch table.
    pub fn dispatch(&self, call: Call<S>) -> RuntimeResult<Reply<S>> {
        self.state.table.dispatch(self, call)
    }

    pub(crate) fn handle(&self) -> Handle<S> {
        self.state.handle.borrow().clone()
    }

    pub(crate) fn set_handle(&self, handle: Handle<S>) {
        *self.state.handle.borrow_mut() = handle;
    }

    pub(crate) fn transient(&self) -> &RefCell<HashMap<String, Value>> {
        &self.state.transient
    }

    /// Invalidate the instance. Returns `false` if it was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.state.closed.replace(true)
    }

    pub(crate) fn closed_error(&self) -> RuntimeError {
        RuntimeError::ClosedInstance {
            identity: self.state.id.to_string(),
        }
    }

    /// The owning session, if it is still alive.
    pub(crate) fn context(&self) -> RuntimeResult<Rc<SessionContext<S>>> {
        self.state.context.upgrade().ok_or_else(|| self.closed_error())
    }

    pub(crate) fn belongs_to(&self, context: &SessionContext<S>) -> bool {
        std::ptr::eq(self.state.context.as_ptr(), context)
    }

    pub(crate) fn identity_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.state.id.hash(&mut hasher);
        hasher.finish()
    }

    // --- convenience wrappers over `dispatch` ---

    /// Read a primitive, transient or custom value.
    pub fn get(&self, name: &str) -> RuntimeResult<Option<Value>> {
        self.dispatch(Call::Get(name.to_string()))?.into_value()
    }

    /// Write a primitive or transient value. Writing `Value::Null` removes it.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> RuntimeResult<()> {
        self.dispatch(Call::Set(name.to_string(), value.into()))?.into_unit()
    }

    pub fn remove(&self, name: &str) -> RuntimeResult<()> {
        self.dispatch(Call::Remove(name.to_string()))?.into_unit()
    }

    /// Follow a single-valued reference or relation endpoint.
    pub fn reference(&self, name: &str) -> RuntimeResult<Option<Instance<S>>> {
        self.dispatch(Call::Get(name.to_string()))?.into_instance()
    }

    /// Point a single-valued reference at `target`, or clear it with `None`.
    pub fn set_reference(&self, name: &str, target: Option<&Instance<S>>) -> RuntimeResult<()> {
        self.dispatch(Call::SetReference(name.to_string(), target.cloned()))?
            .into_unit()
    }

    /// Lazily read a collection accessor.
    pub fn collection(&self, name: &str) -> RuntimeResult<InstanceSeq<S>> {
        self.dispatch(Call::Get(name.to_string()))?.into_sequence()
    }

    pub fn add(&self, name: &str, target: &Instance<S>) -> RuntimeResult<()> {
        self.dispatch(Call::Add(name.to_string(), target.clone()))?.into_unit()
    }

    /// Remove one relation to `target`. Returns whether one was removed.
    pub fn remove_from(&self, name: &str, target: &Instance<S>) -> RuntimeResult<bool> {
        self.dispatch(Call::RemoveFrom(name.to_string(), target.clone()))?
            .into_bool()
    }

    pub fn clear(&self, name: &str) -> RuntimeResult<()> {
        self.dispatch(Call::Clear(name.to_string()))?.into_unit()
    }

    pub fn invoke(&self, name: &str, args: Vec<Value>) -> RuntimeResult<Reply<S>> {
        self.dispatch(Call::Invoke(name.to_string(), args))
    }

    pub fn equals(&self, other: &Instance<S>) -> RuntimeResult<bool> {
        self.dispatch(Call::Equals(other.clone()))?.into_bool()
    }

    pub fn hash_code(&self) -> RuntimeResult<u64> {
        self.dispatch(Call::HashCode)?.into_hash()
    }

    /// Close the instance. Idempotent.
    pub fn close(&self) -> RuntimeResult<()> {
        self.dispatch(Call::Close)?.into_unit()
    }
}

impl<S: DatastoreSession> Clone for Instance<S> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<S: DatastoreSession> PartialEq for Instance<S> {
    fn eq(&self, other: &Self) -> bool {
        self.state.id == other.state.id && Weak::ptr_eq(&self.state.context, &other.state.context)
    }
}

impl<S: DatastoreSession> Eq for Instance<S> {}

impl<S: DatastoreSession> Hash for Instance<S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.state.id.hash(state);
    }
}

impl<S: DatastoreSession> fmt::Debug for Instance<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.state.id)
            .field("capabilities", &self.state.capabilities)
            .field("closed", &self.state.closed.get())
            .finish()
    }
}

impl<S: DatastoreSession> fmt::Display for Instance<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.state.capabilities, self.state.id)
    }
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

/// A lazy sequence of instances backed by a datastore cursor.
///
/// Each item is resolved through the instance cache when it is read. The
/// cursor is released on exhaustion, on the first error, on
/// [`close`](Self::close) and on drop.
pub struct InstanceSeq<S: DatastoreSession> {
    cursor: ResultIter<RuntimeResult<Instance<S>>>,
}

impl<S: DatastoreSession> InstanceSeq<S> {
    pub(crate) fn new(cursor: ResultIter<RuntimeResult<Instance<S>>>) -> Self {
        Self { cursor }
    }

    pub fn close(&mut self) {
        self.cursor.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.is_closed()
    }
}

impl<S: DatastoreSession> Iterator for InstanceSeq<S> {
    type Item = RuntimeResult<Instance<S>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.cursor.next()? {
            Ok(Ok(instance)) => Some(Ok(instance)),
            Ok(Err(e)) => {
                self.cursor.close();
                Some(Err(e))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

impl<S: DatastoreSession> fmt::Debug for InstanceSeq<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceSeq")
            .field("closed", &self.is_closed())
            .finish()
    }
}
