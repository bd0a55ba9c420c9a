//! The dispatch chain.
//!
//! A [`DispatchTable`] maps accessor names to [`Handler`]s for one
//! capability set. It is built once per capability set and shared by every
//! instance of that set. Calls are resolved in a fixed order:
//!
//! 1. identity and lifecycle calls (`Equals`, `HashCode`, `Close`), which
//!    no accessor can override;
//! 2. custom operations registered with the session factory;
//! 3. primitive properties;
//! 4. single-valued references and relation endpoints;
//! 5. collections;
//! 6. transient, instance-local values.
//!
//! Categories 3 to 5 touch the backend and run inside the session's
//! [`TransactionGuard`](crate::transaction::TransactionGuard).

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use polymap_datastore::DatastoreSession;
use polymap_types::{
    AccessorDescriptor, AccessorKind, CapabilitySet, Direction, MetadataProvider,
    PropertyDescriptor, RelationDescriptor, TypeName, Value,
};
use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::{Instance, InstanceSeq};
use crate::session::SessionContext;
use crate::translator::Translator;

// ---------------------------------------------------------------------------
// Calls and replies
// ---------------------------------------------------------------------------

/// One call on an instance.
pub enum Call<S: DatastoreSession> {
    Equals(Instance<S>),
    HashCode,
    Close,
    Get(String),
    Set(String, Value),
    Remove(String),
    SetReference(String, Option<Instance<S>>),
    Add(String, Instance<S>),
    RemoveFrom(String, Instance<S>),
    Clear(String),
    Invoke(String, Vec<Value>),
}

impl<S: DatastoreSession> Call<S> {
    /// The accessor the call addresses; `None` for identity calls.
    pub fn accessor(&self) -> Option<&str> {
        match self {
            Self::Equals(_) | Self::HashCode | Self::Close => None,
            Self::Get(name)
            | Self::Set(name, _)
            | Self::Remove(name)
            | Self::SetReference(name, _)
            | Self::Add(name, _)
            | Self::RemoveFrom(name, _)
            | Self::Clear(name)
            | Self::Invoke(name, _) => Some(name),
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::Equals(_) => "equals",
            Self::HashCode => "hash_code",
            Self::Close => "close",
            Self::Get(_) => "get",
            Self::Set(..) => "set",
            Self::Remove(_) => "remove",
            Self::SetReference(..) => "set_reference",
            Self::Add(..) => "add",
            Self::RemoveFrom(..) => "remove_from",
            Self::Clear(_) => "clear",
            Self::Invoke(..) => "invoke",
        }
    }

    /// Arguments handed to a custom operation.
    fn into_args(self) -> Vec<Value> {
        match self {
            Self::Set(_, value) => vec![value],
            Self::Invoke(_, args) => args,
            _ => Vec::new(),
        }
    }

    pub(crate) fn unsupported(&self) -> RuntimeError {
        RuntimeError::UnsupportedOperation { call: self.to_string() }
    }
}

impl<S: DatastoreSession> fmt::Display for Call<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.accessor() {
            Some(name) => write!(f, "{}({name})", self.verb()),
            None => f.write_str(self.verb()),
        }
    }
}

impl<S: DatastoreSession> fmt::Debug for Call<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The result of a call.
pub enum Reply<S: DatastoreSession> {
    Unit,
    Value(Option<Value>),
    Instance(Option<Instance<S>>),
    Sequence(InstanceSeq<S>),
    Bool(bool),
    Hash(u64),
}

impl<S: DatastoreSession> Reply<S> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Value(_) => "value",
            Self::Instance(_) => "instance",
            Self::Sequence(_) => "sequence",
            Self::Bool(_) => "bool",
            Self::Hash(_) => "hash",
        }
    }

    fn unexpected(self, expected: &'static str) -> RuntimeError {
        RuntimeError::UnexpectedReply {
            expected,
            found: self.kind(),
        }
    }

    pub fn into_unit(self) -> RuntimeResult<()> {
        match self {
            Self::Unit => Ok(()),
            other => Err(other.unexpected("unit")),
        }
    }

    pub fn into_value(self) -> RuntimeResult<Option<Value>> {
        match self {
            Self::Value(value) => Ok(value),
            other => Err(other.unexpected("value")),
        }
    }

    pub fn into_instance(self) -> RuntimeResult<Option<Instance<S>>> {
        match self {
            Self::Instance(instance) => Ok(instance),
            other => Err(other.unexpected("instance")),
        }
    }

    pub fn into_sequence(self) -> RuntimeResult<InstanceSeq<S>> {
        match self {
            Self::Sequence(seq) => Ok(seq),
            other => Err(other.unexpected("sequence")),
        }
    }

    pub fn into_bool(self) -> RuntimeResult<bool> {
        match self {
            Self::Bool(b) => Ok(b),
            other => Err(other.unexpected("bool")),
        }
    }

    pub fn into_hash(self) -> RuntimeResult<u64> {
        match self {
            Self::Hash(h) => Ok(h),
            other => Err(other.unexpected("hash")),
        }
    }
}

impl<S: DatastoreSession> fmt::Debug for Reply<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => f.write_str("Unit"),
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Instance(i) => f.debug_tuple("Instance").field(i).finish(),
            Self::Sequence(s) => f.debug_tuple("Sequence").field(s).finish(),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Hash(h) => f.debug_tuple("Hash").field(h).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Custom operations
// ---------------------------------------------------------------------------

/// Caller-supplied logic bound to an `Implemented` accessor.
///
/// Any `Fn(&Instance<S>, &[Value]) -> RuntimeResult<Reply<S>>` closure is an
/// operation. `Get` calls pass no arguments, `Set` calls pass the written
/// value, `Invoke` calls pass their arguments unchanged.
pub trait CustomOperation<S: DatastoreSession> {
    fn invoke(&self, instance: &Instance<S>, args: &[Value]) -> RuntimeResult<Reply<S>>;
}

impl<S, F> CustomOperation<S> for F
where
    S: DatastoreSession,
    F: Fn(&Instance<S>, &[Value]) -> RuntimeResult<Reply<S>>,
{
    fn invoke(&self, instance: &Instance<S>, args: &[Value]) -> RuntimeResult<Reply<S>> {
        self(instance, args)
    }
}

pub(crate) type SharedOperation<S> = Arc<dyn CustomOperation<S> + Send + Sync>;

/// Custom operations keyed by the `operation` name of `Implemented`
/// accessors.
pub struct OperationRegistry<S: DatastoreSession> {
    operations: HashMap<String, SharedOperation<S>>,
}

impl<S: DatastoreSession> OperationRegistry<S> {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        key: impl Into<String>,
        operation: impl CustomOperation<S> + Send + Sync + 'static,
    ) {
        self.operations.insert(key.into(), Arc::new(operation));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.operations.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub(crate) fn get(&self, key: &str) -> Option<SharedOperation<S>> {
        self.operations.get(key).cloned()
    }
}

impl<S: DatastoreSession> Default for OperationRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: DatastoreSession> Clone for OperationRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            operations: self.operations.clone(),
        }
    }
}

impl<S: DatastoreSession> fmt::Debug for OperationRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.operations.keys().collect();
        keys.sort();
        f.debug_struct("OperationRegistry").field("operations", &keys).finish()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// What a resolved accessor does.
pub(crate) enum Handler<S: DatastoreSession> {
    Implemented(SharedOperation<S>),
    Primitive(PropertyDescriptor),
    EntityReference(RelationDescriptor),
    RelationReference(RelationDescriptor),
    Endpoint(Direction),
    EntityCollection(RelationDescriptor),
    RelationCollection(RelationDescriptor),
    Transient,
}

impl<S: DatastoreSession> Handler<S> {
    fn from_accessor(
        accessor: &AccessorDescriptor,
        operations: &OperationRegistry<S>,
    ) -> RuntimeResult<Self> {
        Ok(match &accessor.kind {
            AccessorKind::Implemented { operation } => {
                let op = operations.get(operation).ok_or_else(|| {
                    RuntimeError::Configuration(format!(
                        "no implementation registered for operation '{operation}' ({}.{})",
                        accessor.declaring_type, accessor.name
                    ))
                })?;
                Self::Implemented(op)
            }
            AccessorKind::Primitive(key) => Self::Primitive(key.clone()),
            AccessorKind::EntityReference(r) => Self::EntityReference(r.clone()),
            AccessorKind::RelationReference(r) => Self::RelationReference(r.clone()),
            AccessorKind::Endpoint(d) => Self::Endpoint(*d),
            AccessorKind::EntityCollection(r) => Self::EntityCollection(r.clone()),
            AccessorKind::RelationCollection(r) => Self::RelationCollection(r.clone()),
            AccessorKind::Transient => Self::Transient,
        })
    }

    /// Whether this handler understands the call's verb.
    pub(crate) fn accepts(&self, call: &Call<S>) -> bool {
        match self {
            Self::Implemented(_) => matches!(call, Call::Get(_) | Call::Set(..) | Call::Invoke(..)),
            Self::Primitive(_) | Self::Transient => {
                matches!(call, Call::Get(_) | Call::Set(..) | Call::Remove(_))
            }
            Self::EntityReference(_) => matches!(call, Call::Get(_) | Call::SetReference(..)),
            Self::RelationReference(_) | Self::Endpoint(_) | Self::RelationCollection(_) => {
                matches!(call, Call::Get(_))
            }
            Self::EntityCollection(_) => matches!(
                call,
                Call::Get(_) | Call::Add(..) | Call::RemoveFrom(..) | Call::Clear(_)
            ),
        }
    }

    /// Whether the handler touches the backend and needs the guard.
    fn is_structural(&self) -> bool {
        !matches!(self, Self::Implemented(_) | Self::Transient)
    }

    fn execute(
        &self,
        context: &Rc<SessionContext<S>>,
        instance: &Instance<S>,
        call: Call<S>,
    ) -> RuntimeResult<Reply<S>> {
        let translator = Translator::new(context);
        match (self, call) {
            (Self::Implemented(op), call) => op.invoke(instance, &call.into_args()),
            (Self::Transient, call) => Ok(transient(instance, call)),
            (Self::Primitive(key), Call::Get(_)) => {
                Ok(Reply::Value(translator.read_primitive(&instance.handle(), key)?))
            }
            (Self::Primitive(key), Call::Set(_, value)) => {
                translator.write_primitive(&instance.handle(), key, value)?;
                Ok(Reply::Unit)
            }
            (Self::Primitive(key), Call::Remove(_)) => {
                translator.remove_primitive(&instance.handle(), key)?;
                Ok(Reply::Unit)
            }
            (Self::EntityReference(rel), Call::Get(_)) => {
                Ok(Reply::Instance(translator.entity_reference(instance, rel)?))
            }
            (Self::EntityReference(rel), Call::SetReference(_, target)) => {
                translator.set_reference(instance, rel, target.as_ref())?;
                Ok(Reply::Unit)
            }
            (Self::RelationReference(rel), Call::Get(_)) => {
                Ok(Reply::Instance(translator.relation_reference(instance, rel)?))
            }
            (Self::Endpoint(direction), Call::Get(_)) => {
                Ok(Reply::Instance(Some(translator.endpoint(instance, *direction)?)))
            }
            (Self::EntityCollection(rel), Call::Get(_)) => {
                Ok(Reply::Sequence(translator.entity_sequence(instance, rel)?))
            }
            (Self::EntityCollection(rel), Call::Add(_, target)) => {
                translator.create_relation(instance, rel, &target, false)?;
                Ok(Reply::Unit)
            }
            (Self::EntityCollection(rel), Call::RemoveFrom(_, target)) => {
                Ok(Reply::Bool(translator.remove_from_collection(instance, rel, &target)?))
            }
            (Self::EntityCollection(rel), Call::Clear(_)) => {
                translator.clear_collection(instance, rel)?;
                Ok(Reply::Unit)
            }
            (Self::RelationCollection(rel), Call::Get(_)) => {
                Ok(Reply::Sequence(translator.relation_sequence(instance, rel)?))
            }
            (_, call) => Err(call.unsupported()),
        }
    }
}

fn transient<S: DatastoreSession>(instance: &Instance<S>, call: Call<S>) -> Reply<S> {
    let mut values = instance.transient().borrow_mut();
    match call {
        Call::Get(name) => Reply::Value(values.get(&name).cloned()),
        Call::Set(name, value) if value.is_null() => {
            values.remove(&name);
            Reply::Unit
        }
        Call::Set(name, value) => {
            values.insert(name, value);
            Reply::Unit
        }
        Call::Remove(name) => {
            values.remove(&name);
            Reply::Unit
        }
        _ => Reply::Unit,
    }
}

// ---------------------------------------------------------------------------
// Dispatch table
// ---------------------------------------------------------------------------

struct Entry<S: DatastoreSession> {
    precedence: u8,
    declared_by: TypeName,
    handler: Handler<S>,
}

/// Accessor handlers for one capability set.
pub struct DispatchTable<S: DatastoreSession> {
    capabilities: CapabilitySet,
    entries: HashMap<String, Entry<S>>,
}

impl<S: DatastoreSession> DispatchTable<S> {
    /// Resolve every accessor of `capabilities`.
    ///
    /// When two accessors share a name the one with the lower precedence
    /// wins. On a tie the first one found is kept and a warning is logged.
    pub(crate) fn build(
        capabilities: &CapabilitySet,
        metadata: &dyn MetadataProvider,
        operations: &OperationRegistry<S>,
    ) -> RuntimeResult<Self> {
        let mut entries: HashMap<String, Entry<S>> = HashMap::new();
        for accessor in metadata.accessors(capabilities)? {
            let precedence = accessor.kind.precedence();
            if let Some(existing) = entries.get(&accessor.name) {
                if existing.precedence < precedence {
                    debug!(
                        accessor = %accessor.name,
                        kept = %existing.declared_by,
                        shadowed = %accessor.declaring_type,
                        "accessor shadowed by higher-precedence handler"
                    );
                    continue;
                }
                if existing.precedence == precedence {
                    warn!(
                        accessor = %accessor.name,
                        kept = %existing.declared_by,
                        ignored = %accessor.declaring_type,
                        %capabilities,
                        "conflicting accessors of the same category; keeping the first"
                    );
                    continue;
                }
            }
            let handler = Handler::from_accessor(accessor, operations)?;
            entries.insert(
                accessor.name.clone(),
                Entry {
                    precedence,
                    declared_by: accessor.declaring_type.clone(),
                    handler,
                },
            );
        }
        debug!(%capabilities, accessors = entries.len(), "dispatch table built");
        Ok(Self {
            capabilities: capabilities.clone(),
            entries,
        })
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<&Handler<S>> {
        self.entries.get(name).map(|entry| &entry.handler)
    }

    pub(crate) fn dispatch(
        &self,
        instance: &Instance<S>,
        call: Call<S>,
    ) -> RuntimeResult<Reply<S>> {
        match &call {
            Call::Close => {
                match instance.context() {
                    Ok(context) => context.close_instance(instance),
                    Err(_) => {
                        instance.mark_closed();
                    }
                }
                return Ok(Reply::Unit);
            }
            _ if instance.is_closed() => return Err(instance.closed_error()),
            Call::Equals(other) => return Ok(Reply::Bool(instance == other)),
            Call::HashCode => return Ok(Reply::Hash(instance.identity_hash())),
            _ => {}
        }

        let handler = call
            .accessor()
            .and_then(|name| self.resolve(name))
            .ok_or_else(|| call.unsupported())?;
        if !handler.accepts(&call) {
            return Err(call.unsupported());
        }

        let context = instance.context()?;
        if !handler.is_structural() {
            return handler.execute(&context, instance, call);
        }
        context
            .guard()
            .run(&context, || handler.execute(&context, instance, call))
    }
}

impl<S: DatastoreSession> fmt::Debug for DispatchTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("DispatchTable")
            .field("capabilities", &self.capabilities)
            .field("accessors", &names)
            .finish()
    }
}
