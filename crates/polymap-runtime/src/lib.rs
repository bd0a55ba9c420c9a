//! Instance lifecycle, dispatch, and transactional-visibility engine.
//!
//! The runtime presents the entities and relationships of a pluggable
//! datastore as polymorphic in-memory [`Instance`]s:
//!
//! - **Identity**: one backend record surfaces as one instance per cache
//!   scope ([`InstanceCache`]).
//! - **Capability polymorphism**: an instance offers the accessors of every
//!   type in its [`CapabilitySet`](polymap_types::CapabilitySet), resolved
//!   once per set into a [`DispatchTable`]. The set can change at runtime
//!   through a [`Migration`] without changing identity.
//! - **Direction-transparent relations**: a relationship is readable from
//!   both endpoints through `From` and `To` accessors.
//! - **Transactional visibility**: structural calls run under a
//!   [`TransactionGuard`] and caches are invalidated at unit-of-work
//!   boundaries according to the [`CacheScope`].
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::builder(InMemoryDatastore::new(), registry).build()?;
//! let session = factory.open()?;
//! let tx = session.transaction();
//! tx.begin()?;
//! let person = session.create(["Person"])?;
//! person.set("name", "Ada")?;
//! tx.commit()?;
//! ```

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod instance;
pub mod listener;
pub mod migration;
pub mod session;
pub mod transaction;
mod translator;

pub use cache::InstanceCache;
pub use config::{CacheScope, RuntimeConfig, TransactionAttribute};
pub use dispatch::{Call, CustomOperation, DispatchTable, OperationRegistry, Reply};
pub use error::{RuntimeError, RuntimeResult};
pub use factory::{SessionFactory, SessionFactoryBuilder};
pub use instance::{Handle, Instance, InstanceSeq, RecordId};
pub use listener::InstanceListener;
pub use migration::Migration;
pub use session::{Session, SessionId};
pub use transaction::{Transaction, TransactionGuard};

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use polymap_datastore::{
        DatastoreError, DatastoreSession, InMemoryDatastore, InMemorySession, TracingDatastore,
        TracingSession,
    };
    use polymap_types::{Direction, MetadataRegistry, TypeDescriptor, Value};
    use proptest::prelude::*;

    type Mem = InMemorySession;

    fn describe<S: DatastoreSession>(
        instance: &Instance<S>,
        _args: &[Value],
    ) -> RuntimeResult<Reply<S>> {
        let value = instance.get("value")?.unwrap_or_default();
        Ok(Reply::Value(Some(Value::from(format!("A[{value}]")))))
    }

    /// Helper to build the shared test model.
    ///
    /// A -A2B-> B with a typed relation, A -PARENT_OF-> B as a plain
    /// collection, C as a migration target and D with a reference and a
    /// collection over the same relationship.
    fn metadata() -> MetadataRegistry {
        MetadataRegistry::new([
            TypeDescriptor::entity("A")
                .primitive("value")
                .primitive("name")
                .indexed("name")
                .reference("b", "A2B", Direction::From, "B")
                .relation_reference("a2b", "A2B", Direction::From, "B")
                .collection("children", "PARENT_OF", Direction::From, "B")
                .transient("scratch")
                .implemented("describe", "describe"),
            TypeDescriptor::entity("B")
                .primitive("value")
                .primitive("name")
                .indexed("name")
                .reference("a", "A2B", Direction::To, "A")
                .relation_reference("a2b", "A2B", Direction::To, "A")
                .collection("parents", "PARENT_OF", Direction::To, "A"),
            TypeDescriptor::relation("A2B", "A2B")
                .primitive("weight")
                .endpoint("from", Direction::From)
                .endpoint("to", Direction::To),
            TypeDescriptor::entity("C").primitive("other"),
            TypeDescriptor::entity("D")
                .reference("item", "HAS", Direction::From, "B")
                .collection("items", "HAS", Direction::From, "B"),
        ])
        .unwrap()
    }

    fn factory_with(
        config: RuntimeConfig,
    ) -> (InMemoryDatastore, SessionFactory<InMemoryDatastore>) {
        let store = InMemoryDatastore::new();
        let factory = SessionFactory::builder(store.clone(), metadata())
            .config(config)
            .implement("describe", describe::<Mem>)
            .build()
            .unwrap();
        (store, factory)
    }

    /// Helper to open a session with a transaction already begun.
    fn open_with(config: RuntimeConfig) -> (InMemoryDatastore, Session<Mem>) {
        let (store, factory) = factory_with(config);
        let session = factory.open().unwrap();
        session.transaction().begin().unwrap();
        (store, session)
    }

    fn open() -> (InMemoryDatastore, Session<Mem>) {
        open_with(RuntimeConfig::default())
    }

    fn session_scope() -> RuntimeConfig {
        RuntimeConfig::default().with_cache_scope(CacheScope::Session)
    }

    fn named(session: &Session<Mem>, ty: &str, name: &str) -> Instance<Mem> {
        let instance = session.create([ty]).unwrap();
        instance.set("name", name).unwrap();
        instance
    }

    fn find_one(session: &Session<Mem>, ty: &str, name: &str) -> Instance<Mem> {
        let mut found = session.find(ty, name).unwrap();
        let instance = found.next().unwrap().unwrap();
        assert!(found.next().is_none());
        instance
    }

    fn count(seq: InstanceSeq<Mem>) -> usize {
        seq.collect::<RuntimeResult<Vec<_>>>().unwrap().len()
    }

    // ---- Test 1: Two lookups of one identity return the same instance ----
    #[test]
    fn lookups_return_identical_instances() {
        let (_, session) = open();
        let a = named(&session, "A", "x");
        let first = find_one(&session, "A", "x");
        let second = find_one(&session, "A", "x");
        assert!(first.is_same(&second));
        assert!(first.is_same(&a));
        assert!(session.instance(a.id()).unwrap().is_same(&a));
    }

    // ---- Test 2: Accessors outside the capability set are rejected ----
    #[test]
    fn foreign_accessor_is_unsupported() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        let b = session.create(["B"]).unwrap();
        assert_eq!(
            a.get("weight").unwrap_err(),
            RuntimeError::UnsupportedOperation { call: "get(weight)".into() }
        );
        assert_eq!(
            a.add("value", &b).unwrap_err(),
            RuntimeError::UnsupportedOperation { call: "add(value)".into() }
        );
        assert!(a.has_accessor("b"));
        assert!(!a.has_accessor("a"));
    }

    // ---- Test 3: Primitive round trip; remove and null write clear ----
    #[test]
    fn primitive_round_trip() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        assert_eq!(a.get("value").unwrap(), None);
        a.set("value", 42).unwrap();
        assert_eq!(a.get("value").unwrap(), Some(Value::Int(42)));
        a.remove("value").unwrap();
        assert_eq!(a.get("value").unwrap(), None);
        a.set("value", "again").unwrap();
        a.set("value", Value::Null).unwrap();
        assert_eq!(a.get("value").unwrap(), None);
    }

    // ---- Test 4: FROM and TO accessors see each other ----
    #[test]
    fn direction_symmetry() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        let b = session.create(["B"]).unwrap();
        assert!(a.reference("b").unwrap().is_none());
        a.set_reference("b", Some(&b)).unwrap();
        assert!(a.reference("b").unwrap().unwrap().is_same(&b));
        assert!(b.reference("a").unwrap().unwrap().is_same(&a));
    }

    // ---- Test 5: Single-valued writes replace the previous relation ----
    #[test]
    fn single_reference_replaces() {
        let (store, session) = open();
        let a = session.create(["A"]).unwrap();
        let b1 = session.create(["B"]).unwrap();
        let b2 = session.create(["B"]).unwrap();
        a.set_reference("b", Some(&b1)).unwrap();
        a.set_reference("b", Some(&b2)).unwrap();
        assert_eq!(store.edge_count().unwrap(), 1);
        assert!(a.reference("b").unwrap().unwrap().is_same(&b2));
        assert!(b1.reference("a").unwrap().is_none());

        a.set_reference("b", None).unwrap();
        assert_eq!(store.edge_count().unwrap(), 0);
        assert!(b2.reference("a").unwrap().is_none());
    }

    // ---- Test 6: Closed instances fail fast; close is idempotent ----
    #[test]
    fn closed_instance_fails_fast() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        let id = a.id().clone();
        a.close().unwrap();
        assert!(matches!(a.get("value"), Err(RuntimeError::ClosedInstance { .. })));
        assert!(matches!(a.equals(&a), Err(RuntimeError::ClosedInstance { .. })));
        a.close().unwrap();
        assert!(session.instance(&id).is_none());
    }

    // ---- Test 7: Migration with transfer ----
    #[test]
    fn migration_with_transfer() {
        let (store, session) = open();
        let a = session.create(["A"]).unwrap();
        a.set("value", 7).unwrap();

        let c = session
            .migrate(&a)
            .to(["C"])
            .with_transfer(|old, new| {
                let value = old.get("value")?.unwrap_or_default();
                new.set("other", value)
            })
            .execute()
            .unwrap();

        assert!(!c.is_same(&a));
        assert_eq!(c.id(), a.id());
        assert!(a.is_closed());
        assert_eq!(c.get("other").unwrap(), Some(Value::Int(7)));
        assert!(matches!(c.get("value"), Err(RuntimeError::UnsupportedOperation { .. })));
        assert!(session.instance(c.id()).unwrap().is_same(&c));
        assert_eq!(store.node_count().unwrap(), 1);

        // State of the dropped type is still in the backend.
        let back = session.migrate(&c).add("A").execute().unwrap();
        assert_eq!(back.get("value").unwrap(), Some(Value::Int(7)));
        assert_eq!(back.get("other").unwrap(), Some(Value::Int(7)));
    }

    // ---- Test 8: Clearing the cache closes every instance ----
    #[test]
    fn clear_closes_all() {
        let (_, session) = open();
        let instances: Vec<_> = (0..3).map(|_| session.create(["A"]).unwrap()).collect();
        assert_eq!(session.cached_instances(), 3);
        assert_eq!(session.clear_cache(), 3);
        for instance in &instances {
            assert!(instance.is_closed());
            assert!(session.instance(instance.id()).is_none());
        }
        assert_eq!(session.clear_cache(), 0);
    }

    // ---- Test 9: MANDATORY requires an active transaction ----
    #[test]
    fn mandatory_guard_requires_transaction() {
        let (_, session) = open_with(session_scope());
        let a = session.create(["A"]).unwrap();
        session.transaction().commit().unwrap();
        assert!(!a.is_closed());
        assert!(matches!(a.set("value", 1), Err(RuntimeError::NoTransaction(_))));
        assert!(matches!(session.create(["A"]), Err(RuntimeError::NoTransaction(_))));
    }

    // ---- Test 10: REQUIRED starts and commits its own unit ----
    #[test]
    fn required_guard_starts_unit() {
        let (store, factory) = factory_with(
            session_scope().with_transaction_attribute(TransactionAttribute::Required),
        );
        let session = factory.open().unwrap();
        let a = session.create(["A"]).unwrap();
        a.set("value", 1).unwrap();
        assert!(!session.transaction().is_active());
        assert_eq!(a.get("value").unwrap(), Some(Value::Int(1)));
        assert_eq!(store.node_count().unwrap(), 1);

        // A failing call rolls back only what its own guard began.
        let b = session.create(["B"]).unwrap();
        b.close().unwrap();
        assert!(matches!(
            a.set_reference("b", Some(&b)),
            Err(RuntimeError::ClosedInstance { .. })
        ));
        assert!(!session.transaction().is_active());
    }

    // ---- Test 11: REQUIRES_NEW nests inside an explicit unit ----
    #[test]
    fn requires_new_nests() {
        let (store, session) = open_with(
            session_scope().with_transaction_attribute(TransactionAttribute::RequiresNew),
        );
        let tx = session.transaction();
        let a = session.create(["A"]).unwrap();
        a.set("value", 1).unwrap();
        assert_eq!(tx.depth(), 1);

        let b = session.create(["B"]).unwrap();
        b.close().unwrap();
        assert!(a.set_reference("b", Some(&b)).is_err());
        assert_eq!(tx.depth(), 1);

        tx.rollback().unwrap();
        assert_eq!(store.node_count().unwrap(), 0);
        assert!(a.is_closed());
    }

    // ---- Test 12: Commit and rollback are callable once per unit ----
    #[test]
    fn double_commit_fails() {
        let (_, session) = open();
        let tx = session.transaction();
        tx.commit().unwrap();
        assert!(matches!(tx.commit(), Err(RuntimeError::NoTransaction(_))));
        assert!(matches!(tx.rollback(), Err(RuntimeError::NoTransaction(_))));
    }

    // ---- Test 13: Custom operations ----
    #[test]
    fn custom_operation_dispatch() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        a.set("value", 3).unwrap();
        assert_eq!(a.get("describe").unwrap(), Some(Value::from("A[3]")));
        let reply = a.invoke("describe", vec![]).unwrap();
        assert_eq!(reply.into_value().unwrap(), Some(Value::from("A[3]")));
        assert!(matches!(
            a.reference("describe"),
            Err(RuntimeError::UnexpectedReply { expected: "instance", found: "value" })
        ));
    }

    #[test]
    fn missing_operation_fails_at_build() {
        let err = SessionFactory::builder(InMemoryDatastore::new(), metadata())
            .build()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(msg) if msg.contains("describe")));
    }

    // ---- Test 14: Transient values stay on the instance ----
    #[test]
    fn transient_values_are_local() {
        let (_, session) = open_with(session_scope());
        let a = named(&session, "A", "x");
        session.transaction().commit().unwrap();
        a.set("scratch", "tmp").unwrap();
        assert_eq!(a.get("scratch").unwrap(), Some(Value::from("tmp")));

        session.clear_cache();
        session.transaction().begin().unwrap();
        let reloaded = find_one(&session, "A", "x");
        assert_eq!(reloaded.get("scratch").unwrap(), None);
    }

    // ---- Test 15: Listeners observe the lifecycle ----
    struct Recorder {
        events: Rc<RefCell<Vec<String>>>,
        fail_create: bool,
    }

    impl InstanceListener<Mem> for Recorder {
        fn post_create(&self, instance: &Instance<Mem>) -> RuntimeResult<()> {
            self.events.borrow_mut().push(format!("create {}", instance.capabilities()));
            if self.fail_create {
                return Err(RuntimeError::custom("rejected"));
            }
            Ok(())
        }

        fn post_load(&self, instance: &Instance<Mem>) -> RuntimeResult<()> {
            self.events.borrow_mut().push(format!("load {}", instance.capabilities()));
            Ok(())
        }

        fn pre_delete(&self, _instance: &Instance<Mem>) -> RuntimeResult<()> {
            self.events.borrow_mut().push("pre_delete".into());
            Ok(())
        }

        fn post_delete(&self, instance: &Instance<Mem>) -> RuntimeResult<()> {
            assert!(instance.is_closed());
            self.events.borrow_mut().push("post_delete".into());
            Ok(())
        }
    }

    #[test]
    fn listeners_observe_lifecycle() {
        let (_, session) = open();
        let events = Rc::new(RefCell::new(Vec::new()));
        session.register_listener(Recorder {
            events: Rc::clone(&events),
            fail_create: false,
        });
        let a = named(&session, "A", "x");
        session.clear_cache();
        let loaded = find_one(&session, "A", "x");
        assert!(!loaded.is_same(&a));
        session.delete(&loaded).unwrap();
        assert_eq!(
            *events.borrow(),
            vec!["create {A}", "load {A}", "pre_delete", "post_delete"]
        );
    }

    #[test]
    fn failing_post_create_closes_instance() {
        let (store, session) = open();
        session.register_listener(Recorder {
            events: Rc::new(RefCell::new(Vec::new())),
            fail_create: true,
        });
        assert_eq!(session.create(["A"]).unwrap_err(), RuntimeError::custom("rejected"));
        assert_eq!(session.cached_instances(), 0);
        assert_eq!(store.node_count().unwrap(), 1);
    }

    // ---- Test 16: Typed relations ----
    #[test]
    fn relation_instances() {
        let (store, session) = open();
        let a = session.create(["A"]).unwrap();
        let b = session.create(["B"]).unwrap();
        let r = session.create_relation(&a, "A2B", &b).unwrap();
        assert!(r.is_relation());
        r.set("weight", 2.5).unwrap();
        assert_eq!(r.get("weight").unwrap(), Some(Value::Float(2.5)));
        assert!(r.reference("from").unwrap().unwrap().is_same(&a));
        assert!(r.reference("to").unwrap().unwrap().is_same(&b));
        assert!(a.reference("a2b").unwrap().unwrap().is_same(&r));
        assert!(b.reference("a2b").unwrap().unwrap().is_same(&r));
        assert!(a.reference("b").unwrap().unwrap().is_same(&b));

        // A single-valued accessor on either side replaces the old relation.
        let b2 = session.create(["B"]).unwrap();
        let r2 = session.create_relation(&a, "A2B", &b2).unwrap();
        assert!(r.is_closed());
        assert_eq!(store.edge_count().unwrap(), 1);
        assert!(a.reference("a2b").unwrap().unwrap().is_same(&r2));
        assert!(matches!(a.collection("a2b"), Err(RuntimeError::UnexpectedReply { .. })));
    }

    #[test]
    fn relation_type_checks() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        let b = session.create(["B"]).unwrap();
        assert!(matches!(
            session.create_relation(&a, "A", &b),
            Err(RuntimeError::Configuration(_))
        ));
        assert!(matches!(session.create(["A2B"]), Err(RuntimeError::Configuration(_))));
        assert!(matches!(session.create(["Ghost"]), Err(RuntimeError::Metadata(_))));
    }

    // ---- Test 17: Deletion retires instances ----
    #[test]
    fn delete_relation_and_entity() {
        let (store, session) = open();
        let a = session.create(["A"]).unwrap();
        let b = session.create(["B"]).unwrap();
        let r = session.create_relation(&a, "A2B", &b).unwrap();

        assert!(matches!(
            session.delete(&a),
            Err(RuntimeError::Datastore(DatastoreError::EntityHasRelations { count: 1, .. }))
        ));
        assert!(!a.is_closed());

        session.delete(&r).unwrap();
        assert!(r.is_closed());
        assert!(a.reference("b").unwrap().is_none());
        session.delete(&a).unwrap();
        assert!(a.is_closed());
        assert!(session.instance(a.id()).is_none());
        assert_eq!(store.node_count().unwrap(), 1);
    }

    // ---- Test 18: Ambiguous single-valued reads ----
    #[test]
    fn ambiguous_reference() {
        let (_, session) = open();
        let d = session.create(["D"]).unwrap();
        let b1 = session.create(["B"]).unwrap();
        let b2 = session.create(["B"]).unwrap();
        d.add("items", &b1).unwrap();
        assert!(d.reference("item").unwrap().unwrap().is_same(&b1));
        d.add("items", &b2).unwrap();
        assert_eq!(
            d.reference("item").unwrap_err(),
            RuntimeError::AmbiguousRelation { relationship: "HAS".into() }
        );
    }

    // ---- Test 19: Collection editing ----
    #[test]
    fn collection_editing() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        let b1 = session.create(["B"]).unwrap();
        let b2 = session.create(["B"]).unwrap();
        a.add("children", &b1).unwrap();
        a.add("children", &b2).unwrap();
        assert_eq!(count(a.collection("children").unwrap()), 2);
        assert!(b1.collection("parents").unwrap().next().unwrap().unwrap().is_same(&a));

        assert!(a.remove_from("children", &b1).unwrap());
        assert!(!a.remove_from("children", &b1).unwrap());
        assert_eq!(count(a.collection("children").unwrap()), 1);

        a.clear("children").unwrap();
        assert_eq!(count(a.collection("children").unwrap()), 0);
        assert_eq!(count(b2.collection("parents").unwrap()), 0);
    }

    // ---- Test 20: Sequences release their cursor ----
    #[test]
    fn sequences_release_cursor() {
        let (store, session) = open();
        let a = session.create(["A"]).unwrap();
        for _ in 0..3 {
            let b = session.create(["B"]).unwrap();
            a.add("children", &b).unwrap();
        }

        let mut seq = a.collection("children").unwrap();
        assert!(seq.next().unwrap().is_ok());
        assert_eq!(store.open_cursors(), 1);
        drop(seq);
        assert_eq!(store.open_cursors(), 0);

        store.fail_relation_reads_after(1).unwrap();
        let result: RuntimeResult<Vec<_>> = a.collection("children").unwrap().collect();
        assert!(matches!(result, Err(RuntimeError::Datastore(DatastoreError::Io(_)))));
        assert_eq!(store.open_cursors(), 0);
        store.clear_faults().unwrap();
    }

    // ---- Test 21: A failed backend migration leaves the instance usable ----
    #[test]
    fn failed_migration_keeps_old_instance() {
        let (_, factory) = factory_with(session_scope());
        let first = factory.open().unwrap();
        first.transaction().begin().unwrap();
        let a = named(&first, "A", "x");
        a.set("value", 5).unwrap();
        first.transaction().commit().unwrap();

        let second = factory.open().unwrap();
        second.transaction().begin().unwrap();
        let other = find_one(&second, "A", "x");
        second.delete(&other).unwrap();
        second.transaction().commit().unwrap();

        first.transaction().begin().unwrap();
        let err = first.migrate(&a).to(["C"]).execute().unwrap_err();
        assert!(matches!(err, RuntimeError::Datastore(DatastoreError::EntityNotFound(_))));
        assert!(!a.is_closed());
        assert!(first.instance(a.id()).unwrap().is_same(&a));
    }

    #[test]
    fn failing_transfer_keeps_migration() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        let err = session
            .migrate(&a)
            .add("C")
            .with_transfer(|_, _| Err(RuntimeError::custom("transfer failed")))
            .execute()
            .unwrap_err();
        assert_eq!(err, RuntimeError::custom("transfer failed"));
        assert!(a.is_closed());
        let migrated = session.instance(a.id()).unwrap();
        assert_eq!(migrated.capabilities().to_string(), "{A, C}");
    }

    #[test]
    fn invalid_migrations() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        let b = session.create(["B"]).unwrap();
        let r = session.create_relation(&a, "A2B", &b).unwrap();
        assert!(matches!(
            session.migrate(&a).remove("A").execute(),
            Err(RuntimeError::InvalidMigration(_))
        ));
        assert!(matches!(
            session.migrate(&r).to(["C"]).execute(),
            Err(RuntimeError::InvalidMigration(_))
        ));
        assert!(matches!(
            session.migrate(&a).to(["A2B"]).execute(),
            Err(RuntimeError::InvalidMigration(_))
        ));
        assert!(!a.is_closed());
    }

    #[test]
    fn superset_migration_keeps_relations() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        let b = session.create(["B"]).unwrap();
        let child = session.create(["B"]).unwrap();
        a.set_reference("b", Some(&b)).unwrap();
        a.add("children", &child).unwrap();

        let migrated = session.migrate(&a).add("C").execute().unwrap();
        assert!(migrated.reference("b").unwrap().unwrap().is_same(&b));
        assert!(b.reference("a").unwrap().unwrap().is_same(&migrated));
        assert_eq!(count(migrated.collection("children").unwrap()), 1);
        let parent = child.collection("parents").unwrap().next().unwrap().unwrap();
        assert!(parent.is_same(&migrated));
    }

    #[test]
    fn migrating_evicted_instance_closes_reloaded_one() {
        let (_, session) = open();
        let a = named(&session, "A", "x");
        session.remove_instance(&a).unwrap();
        let reloaded = find_one(&session, "A", "x");

        let migrated = session.migrate(&a).add("C").execute().unwrap();
        assert!(reloaded.is_closed());
        assert!(a.is_closed());
        assert!(session.instance(a.id()).unwrap().is_same(&migrated));
        assert!(find_one(&session, "A", "x").is_same(&migrated));
    }

    // ---- Test 22: Cache scopes ----
    #[test]
    fn transaction_scope_clears_on_commit() {
        let (_, session) = open();
        let a = session.create(["A"]).unwrap();
        let tx = session.transaction();
        tx.begin().unwrap();
        tx.commit().unwrap();
        assert!(!a.is_closed(), "nested commit keeps the cache");
        tx.commit().unwrap();
        assert!(a.is_closed());
        assert_eq!(session.cached_instances(), 0);
    }

    #[test]
    fn session_scope_survives_commit_but_not_rollback() {
        let (_, session) = open_with(session_scope());
        let a = session.create(["A"]).unwrap();
        let tx = session.transaction();
        tx.commit().unwrap();
        assert!(!a.is_closed());
        tx.begin().unwrap();
        tx.rollback().unwrap();
        assert!(a.is_closed());
    }

    #[test]
    fn nested_rollback_retires_created_records() {
        let (store, session) = open();
        let tx = session.transaction();
        let a = session.create(["A"]).unwrap();
        tx.begin().unwrap();
        let b = session.create(["B"]).unwrap();
        b.set("value", 1).unwrap();
        a.add("children", &b).unwrap();
        tx.rollback().unwrap();

        assert_eq!(tx.depth(), 1);
        assert_eq!(store.node_count().unwrap(), 1);
        assert!(b.is_closed());
        assert!(session.instance(b.id()).is_none());
        assert!(!a.is_closed());
        assert_eq!(count(a.collection("children").unwrap()), 0);
        tx.commit().unwrap();
        assert_eq!(tx.depth(), 0);
    }

    #[test]
    fn nested_rollback_undoes_migrated_instance() {
        let (store, session) = open_with(session_scope());
        let tx = session.transaction();
        let a = named(&session, "A", "x");
        tx.begin().unwrap();
        let migrated = session.migrate(&a).add("C").execute().unwrap();
        tx.rollback().unwrap();

        assert!(migrated.is_closed());
        assert!(session.instance(a.id()).is_none());
        let reloaded = find_one(&session, "A", "x");
        assert_eq!(reloaded.capabilities().to_string(), "{A}");
        tx.commit().unwrap();
        assert_eq!(store.flush_count(), 1, "the earlier write to A is still flushed");
    }

    #[test]
    fn nested_commit_hands_records_to_parent() {
        let (store, session) = open_with(session_scope());
        let tx = session.transaction();
        tx.begin().unwrap();
        let b = session.create(["B"]).unwrap();
        tx.commit().unwrap();
        assert!(!b.is_closed());
        tx.rollback().unwrap();
        assert!(b.is_closed());
        assert_eq!(store.node_count().unwrap(), 0);
    }

    // ---- Test 23: Flushing dirty entities ----
    #[test]
    fn commit_flushes_dirty_entities() {
        let (store, session) = open();
        let a = session.create(["A"]).unwrap();
        a.set("value", 1).unwrap();
        assert_eq!(session.flush().unwrap(), 1);
        assert_eq!(store.flush_count(), 1);
        assert_eq!(session.flush().unwrap(), 0);

        a.set("value", 2).unwrap();
        session.transaction().commit().unwrap();
        assert_eq!(store.flush_count(), 2);
    }

    // ---- Test 24: Closing the session ----
    #[test]
    fn close_rolls_back_and_invalidates() {
        let (store, session) = open();
        let a = session.create(["A"]).unwrap();
        session.close().unwrap();
        assert!(a.is_closed());
        assert_eq!(store.node_count().unwrap(), 0);
        assert!(matches!(session.create(["A"]), Err(RuntimeError::SessionClosed)));
        assert!(matches!(session.transaction().begin(), Err(RuntimeError::SessionClosed)));
        session.close().unwrap();
    }

    // ---- Test 25: Instances are bound to their session ----
    #[test]
    fn foreign_instances_are_not_managed() {
        let (_, factory) = factory_with(RuntimeConfig::default());
        let first = factory.open().unwrap();
        let second = factory.open().unwrap();
        first.transaction().begin().unwrap();
        second.transaction().begin().unwrap();
        let a = first.create(["A"]).unwrap();
        let b = second.create(["B"]).unwrap();
        assert!(matches!(a.set_reference("b", Some(&b)), Err(RuntimeError::NotManaged(_))));
        assert!(matches!(second.id(&a), Err(RuntimeError::NotManaged(_))));
        assert_eq!(first.id(&a).unwrap(), *a.id());
        assert_ne!(first.session_id(), second.session_id());
    }

    // ---- Test 26: Identity operations ----
    #[test]
    fn equality_and_hash_by_identity() {
        let (_, session) = open();
        let a = named(&session, "A", "x");
        let b = session.create(["B"]).unwrap();
        let found = find_one(&session, "A", "x");
        assert!(a.equals(&found).unwrap());
        assert!(!a.equals(&b).unwrap());
        assert_eq!(a.hash_code().unwrap(), found.hash_code().unwrap());
        assert_eq!(a, found);
    }

    // ---- Test 27: Evicting without closing ----
    #[test]
    fn remove_instance_evicts_only() {
        let (_, session) = open();
        let a = named(&session, "A", "x");
        let evicted = session.remove_instance(&a).unwrap();
        assert!(evicted.is_same(&a));
        assert!(!a.is_closed());
        let reloaded = find_one(&session, "A", "x");
        assert!(!reloaded.is_same(&a));
        assert_eq!(reloaded, a);
        session.close_instance(&reloaded);
        assert!(reloaded.is_closed());
        assert!(session.instance(a.id()).is_none());
    }

    // ---- Test 28: Any datastore can be decorated ----
    #[test]
    fn works_through_tracing_datastore() {
        let store = InMemoryDatastore::new();
        let factory = SessionFactory::builder(TracingDatastore::new(store.clone()), metadata())
            .implement("describe", describe::<TracingSession<Mem>>)
            .build()
            .unwrap();
        let session = factory.open().unwrap();
        let tx = session.transaction();
        tx.begin().unwrap();
        let a = session.create(["A"]).unwrap();
        let b = session.create(["B"]).unwrap();
        a.set("value", 9).unwrap();
        a.set_reference("b", Some(&b)).unwrap();
        assert_eq!(a.get("describe").unwrap(), Some(Value::from("A[9]")));
        tx.commit().unwrap();
        assert_eq!(store.node_count().unwrap(), 2);
        assert_eq!(store.edge_count().unwrap(), 1);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            "[a-z]{0,12}".prop_map(Value::Text),
        ]
    }

    proptest! {
        #[test]
        fn primitive_writes_read_back(values in proptest::collection::vec(arb_value(), 1..8)) {
            let (_, session) = open();
            let a = session.create(["A"]).unwrap();
            for value in values {
                a.set("value", value.clone()).unwrap();
                prop_assert_eq!(a.get("value").unwrap(), Some(value));
            }
        }

        #[test]
        fn one_instance_per_identity(lookups in proptest::collection::vec(0usize..4, 1..16)) {
            let (_, session) = open();
            let created: Vec<_> = (0..4).map(|i| named(&session, "B", &format!("b{i}"))).collect();
            for i in lookups {
                let found = find_one(&session, "B", &format!("b{i}"));
                prop_assert!(found.is_same(&created[i]));
            }
            prop_assert_eq!(session.cached_instances(), 4);
        }
    }
}
