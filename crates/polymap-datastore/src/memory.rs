//! In-memory property graph for testing and embedding.
//!
//! [`InMemoryDatastore`] keeps labelled nodes and typed, directed edges in a
//! `BTreeMap` behind a `RwLock`. Every [`InMemorySession`] created from it
//! sees the same graph. Transactions are implemented with an undo log:
//! each begun transaction pushes a frame, a nested commit folds its frame
//! into the parent, and a rollback replays the frame in reverse. There is
//! no isolation between sessions; writes are visible as soon as they are
//! made.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use polymap_types::{
    CapabilitySet, Direction, Discriminator, PropertyDescriptor, TypeDescriptor, Value,
};
use tracing::debug;

use crate::cursor::ResultIter;
use crate::error::{DatastoreError, DatastoreResult};
use crate::traits::{Datastore, DatastoreSession};

// ---------------------------------------------------------------------------
// Identities and handles
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(u64);

impl EdgeId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edge:{}", self.0)
    }
}

/// Handle to a node. Node data lives in the shared graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryNode {
    id: NodeId,
}

impl MemoryNode {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

/// Handle to an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryEdge {
    id: EdgeId,
}

impl MemoryEdge {
    pub fn id(&self) -> EdgeId {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Graph state
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
struct Node {
    labels: BTreeSet<Discriminator>,
    properties: BTreeMap<String, Value>,
}

#[derive(Clone, Debug)]
struct Edge {
    relationship: Discriminator,
    from: NodeId,
    to: NodeId,
    properties: BTreeMap<String, Value>,
}

impl Edge {
    fn endpoint(&self, direction: Direction) -> NodeId {
        match direction {
            Direction::From => self.from,
            Direction::To => self.to,
        }
    }
}

#[derive(Debug, Default)]
struct GraphState {
    next_node: u64,
    next_edge: u64,
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
}

impl GraphState {
    fn node(&self, id: NodeId) -> DatastoreResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| DatastoreError::EntityNotFound(id.to_string()))
    }

    fn node_mut(&mut self, id: NodeId) -> DatastoreResult<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| DatastoreError::EntityNotFound(id.to_string()))
    }

    fn edge(&self, id: EdgeId) -> DatastoreResult<&Edge> {
        self.edges
            .get(&id)
            .ok_or_else(|| DatastoreError::RelationNotFound(id.to_string()))
    }

    fn edge_mut(&mut self, id: EdgeId) -> DatastoreResult<&mut Edge> {
        self.edges
            .get_mut(&id)
            .ok_or_else(|| DatastoreError::RelationNotFound(id.to_string()))
    }

    fn degree(&self, id: NodeId) -> usize {
        self.edges.values().filter(|e| e.from == id || e.to == id).count()
    }

    fn undo(&mut self, entry: Undo) {
        match entry {
            Undo::CreateNode(id) => {
                self.nodes.remove(&id);
            }
            Undo::DeleteNode(id, node) => {
                self.nodes.insert(id, node);
            }
            Undo::NodeProperty(id, key, previous) => {
                if let Some(node) = self.nodes.get_mut(&id) {
                    restore(&mut node.properties, key, previous);
                }
            }
            Undo::NodeLabels(id, labels) => {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.labels = labels;
                }
            }
            Undo::CreateEdge(id) => {
                self.edges.remove(&id);
            }
            Undo::DeleteEdge(id, edge) => {
                self.edges.insert(id, edge);
            }
            Undo::EdgeProperty(id, key, previous) => {
                if let Some(edge) = self.edges.get_mut(&id) {
                    restore(&mut edge.properties, key, previous);
                }
            }
        }
    }
}

fn restore(properties: &mut BTreeMap<String, Value>, key: String, previous: Option<Value>) {
    match previous {
        Some(value) => {
            properties.insert(key, value);
        }
        None => {
            properties.remove(&key);
        }
    }
}

/// One reversible change, recorded with the state needed to revert it.
#[derive(Debug)]
enum Undo {
    CreateNode(NodeId),
    DeleteNode(NodeId, Node),
    NodeProperty(NodeId, String, Option<Value>),
    NodeLabels(NodeId, BTreeSet<Discriminator>),
    CreateEdge(EdgeId),
    DeleteEdge(EdgeId, Edge),
    EdgeProperty(EdgeId, String, Option<Value>),
}

/// Counters and fault switches shared by a datastore and its sessions.
#[derive(Debug, Default)]
struct Stats {
    open_cursors: AtomicUsize,
    flushes: AtomicUsize,
    fail_relation_reads_after: Mutex<Option<usize>>,
}

// ---------------------------------------------------------------------------
// Datastore
// ---------------------------------------------------------------------------

/// An in-memory labelled property graph.
///
/// Cloning yields another handle to the same graph.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDatastore {
    graph: Arc<RwLock<GraphState>>,
    stats: Arc<Stats>,
}

impl InMemoryDatastore {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> DatastoreResult<usize> {
        Ok(read_graph(&self.graph)?.nodes.len())
    }

    pub fn edge_count(&self) -> DatastoreResult<usize> {
        Ok(read_graph(&self.graph)?.edges.len())
    }

    /// Number of relationship cursors not yet released.
    pub fn open_cursors(&self) -> usize {
        self.stats.open_cursors.load(Ordering::SeqCst)
    }

    /// Number of `flush_entity` calls served so far.
    pub fn flush_count(&self) -> usize {
        self.stats.flushes.load(Ordering::SeqCst)
    }

    /// Make every subsequent relationship cursor fail with an I/O error
    /// after yielding `after` relations.
    pub fn fail_relation_reads_after(&self, after: usize) -> DatastoreResult<()> {
        *self.fault()? = Some(after);
        Ok(())
    }

    /// Remove any injected fault.
    pub fn clear_faults(&self) -> DatastoreResult<()> {
        *self.fault()? = None;
        Ok(())
    }

    fn fault(&self) -> DatastoreResult<std::sync::MutexGuard<'_, Option<usize>>> {
        self.stats
            .fail_relation_reads_after
            .lock()
            .map_err(|e| DatastoreError::LockPoisoned(e.to_string()))
    }
}

impl Datastore for InMemoryDatastore {
    type Session = InMemorySession;

    fn create_session(&self) -> DatastoreResult<InMemorySession> {
        Ok(InMemorySession {
            graph: Arc::clone(&self.graph),
            stats: Arc::clone(&self.stats),
            frames: Vec::new(),
        })
    }
}

fn read_graph(graph: &RwLock<GraphState>) -> DatastoreResult<RwLockReadGuard<'_, GraphState>> {
    graph
        .read()
        .map_err(|e| DatastoreError::LockPoisoned(e.to_string()))
}

fn write_graph(graph: &RwLock<GraphState>) -> DatastoreResult<RwLockWriteGuard<'_, GraphState>> {
    graph
        .write()
        .map_err(|e| DatastoreError::LockPoisoned(e.to_string()))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A session over an [`InMemoryDatastore`].
#[derive(Debug)]
pub struct InMemorySession {
    graph: Arc<RwLock<GraphState>>,
    stats: Arc<Stats>,
    frames: Vec<Vec<Undo>>,
}

impl InMemorySession {
    /// Nesting depth of the active transaction, 0 when none is active.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Run a write against the graph, recording its undo entries in the
    /// innermost frame.
    fn write<T>(
        &mut self,
        op: impl FnOnce(&mut GraphState, &mut Vec<Undo>) -> DatastoreResult<T>,
    ) -> DatastoreResult<T> {
        let frame = self.frames.last_mut().ok_or(DatastoreError::NoActiveTransaction)?;
        let mut graph = write_graph(&self.graph)?;
        op(&mut graph, frame)
    }

    fn cursor<T: 'static>(&self, items: Vec<T>) -> DatastoreResult<ResultIter<T>> {
        let fail_after = *self
            .stats
            .fail_relation_reads_after
            .lock()
            .map_err(|e| DatastoreError::LockPoisoned(e.to_string()))?;
        let source = items.into_iter().enumerate().map(move |(i, item)| match fail_after {
            Some(limit) if i >= limit => {
                Err(DatastoreError::Io("injected relation read failure".into()))
            }
            _ => Ok(item),
        });
        self.stats.open_cursors.fetch_add(1, Ordering::SeqCst);
        let stats = Arc::clone(&self.stats);
        Ok(ResultIter::with_close(source, move || {
            stats.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

impl DatastoreSession for InMemorySession {
    type EntityId = NodeId;
    type RelationId = EdgeId;
    type Entity = MemoryNode;
    type Relation = MemoryEdge;

    fn begin(&mut self) -> DatastoreResult<()> {
        self.frames.push(Vec::new());
        debug!(depth = self.frames.len(), "memory transaction begun");
        Ok(())
    }

    fn commit(&mut self) -> DatastoreResult<()> {
        let frame = self.frames.pop().ok_or(DatastoreError::NoActiveTransaction)?;
        if let Some(parent) = self.frames.last_mut() {
            parent.extend(frame);
        }
        debug!(depth = self.frames.len(), "memory transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> DatastoreResult<()> {
        let frame = self.frames.pop().ok_or(DatastoreError::NoActiveTransaction)?;
        let undone = frame.len();
        let mut graph = write_graph(&self.graph)?;
        for entry in frame.into_iter().rev() {
            graph.undo(entry);
        }
        debug!(depth = self.frames.len(), undone, "memory transaction rolled back");
        Ok(())
    }

    fn is_active(&self) -> bool {
        !self.frames.is_empty()
    }

    fn entity_id(&self, entity: &MemoryNode) -> NodeId {
        entity.id
    }

    fn entity_discriminators(
        &self,
        entity: &MemoryNode,
    ) -> DatastoreResult<BTreeSet<Discriminator>> {
        Ok(read_graph(&self.graph)?.node(entity.id)?.labels.clone())
    }

    fn create_entity(
        &mut self,
        _types: &CapabilitySet,
        discriminators: &BTreeSet<Discriminator>,
    ) -> DatastoreResult<MemoryNode> {
        self.write(|graph, undo| {
            graph.next_node += 1;
            let id = NodeId(graph.next_node);
            graph.nodes.insert(
                id,
                Node {
                    labels: discriminators.clone(),
                    properties: BTreeMap::new(),
                },
            );
            undo.push(Undo::CreateNode(id));
            Ok(MemoryNode { id })
        })
    }

    fn delete_entity(&mut self, entity: &MemoryNode) -> DatastoreResult<()> {
        self.write(|graph, undo| {
            graph.node(entity.id)?;
            let count = graph.degree(entity.id);
            if count > 0 {
                return Err(DatastoreError::EntityHasRelations {
                    id: entity.id.to_string(),
                    count,
                });
            }
            if let Some(node) = graph.nodes.remove(&entity.id) {
                undo.push(Undo::DeleteNode(entity.id, node));
            }
            Ok(())
        })
    }

    fn find_entity(
        &self,
        _ty: &TypeDescriptor,
        discriminator: &Discriminator,
        key: &PropertyDescriptor,
        value: &Value,
    ) -> DatastoreResult<ResultIter<MemoryNode>> {
        let graph = read_graph(&self.graph)?;
        let matches: Vec<MemoryNode> = graph
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.labels.contains(discriminator) && node.properties.get(&key.key) == Some(value)
            })
            .map(|(id, _)| MemoryNode { id: *id })
            .collect();
        Ok(ResultIter::from_vec(matches))
    }

    fn migrate_entity(
        &mut self,
        entity: &MemoryNode,
        _types: &CapabilitySet,
        discriminators: &BTreeSet<Discriminator>,
        _target_types: &CapabilitySet,
        target_discriminators: &BTreeSet<Discriminator>,
    ) -> DatastoreResult<MemoryNode> {
        self.write(|graph, undo| {
            let node = graph.node_mut(entity.id)?;
            let previous = node.labels.clone();
            for removed in discriminators.difference(target_discriminators) {
                node.labels.remove(removed);
            }
            node.labels.extend(target_discriminators.iter().cloned());
            undo.push(Undo::NodeLabels(entity.id, previous));
            Ok(*entity)
        })
    }

    fn flush_entity(&mut self, entity: &MemoryNode) -> DatastoreResult<()> {
        read_graph(&self.graph)?.node(entity.id)?;
        self.stats.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn entity_property(
        &self,
        entity: &MemoryNode,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<Option<Value>> {
        Ok(read_graph(&self.graph)?
            .node(entity.id)?
            .properties
            .get(&key.key)
            .cloned())
    }

    fn set_entity_property(
        &mut self,
        entity: &MemoryNode,
        key: &PropertyDescriptor,
        value: Value,
    ) -> DatastoreResult<()> {
        self.write(|graph, undo| {
            let node = graph.node_mut(entity.id)?;
            let previous = node.properties.insert(key.key.clone(), value);
            undo.push(Undo::NodeProperty(entity.id, key.key.clone(), previous));
            Ok(())
        })
    }

    fn remove_entity_property(
        &mut self,
        entity: &MemoryNode,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<()> {
        self.write(|graph, undo| {
            let node = graph.node_mut(entity.id)?;
            if let Some(previous) = node.properties.remove(&key.key) {
                undo.push(Undo::NodeProperty(entity.id, key.key.clone(), Some(previous)));
            }
            Ok(())
        })
    }

    fn relation_property(
        &self,
        relation: &MemoryEdge,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<Option<Value>> {
        Ok(read_graph(&self.graph)?
            .edge(relation.id)?
            .properties
            .get(&key.key)
            .cloned())
    }

    fn set_relation_property(
        &mut self,
        relation: &MemoryEdge,
        key: &PropertyDescriptor,
        value: Value,
    ) -> DatastoreResult<()> {
        self.write(|graph, undo| {
            let edge = graph.edge_mut(relation.id)?;
            let previous = edge.properties.insert(key.key.clone(), value);
            undo.push(Undo::EdgeProperty(relation.id, key.key.clone(), previous));
            Ok(())
        })
    }

    fn remove_relation_property(
        &mut self,
        relation: &MemoryEdge,
        key: &PropertyDescriptor,
    ) -> DatastoreResult<()> {
        self.write(|graph, undo| {
            let edge = graph.edge_mut(relation.id)?;
            if let Some(previous) = edge.properties.remove(&key.key) {
                undo.push(Undo::EdgeProperty(relation.id, key.key.clone(), Some(previous)));
            }
            Ok(())
        })
    }

    fn relation_id(&self, relation: &MemoryEdge) -> EdgeId {
        relation.id
    }

    fn relation_discriminator(&self, relation: &MemoryEdge) -> DatastoreResult<Discriminator> {
        Ok(read_graph(&self.graph)?.edge(relation.id)?.relationship.clone())
    }

    fn create_relation(
        &mut self,
        source: &MemoryNode,
        relationship: &Discriminator,
        direction: Direction,
        target: &MemoryNode,
    ) -> DatastoreResult<MemoryEdge> {
        let (from, to) = match direction {
            Direction::From => (source.id, target.id),
            Direction::To => (target.id, source.id),
        };
        self.write(|graph, undo| {
            graph.node(from)?;
            graph.node(to)?;
            graph.next_edge += 1;
            let id = EdgeId(graph.next_edge);
            graph.edges.insert(
                id,
                Edge {
                    relationship: relationship.clone(),
                    from,
                    to,
                    properties: BTreeMap::new(),
                },
            );
            undo.push(Undo::CreateEdge(id));
            Ok(MemoryEdge { id })
        })
    }

    fn delete_relation(&mut self, relation: &MemoryEdge) -> DatastoreResult<()> {
        self.write(|graph, undo| {
            let edge = graph
                .edges
                .remove(&relation.id)
                .ok_or_else(|| DatastoreError::RelationNotFound(relation.id.to_string()))?;
            undo.push(Undo::DeleteEdge(relation.id, edge));
            Ok(())
        })
    }

    fn from_entity(&self, relation: &MemoryEdge) -> DatastoreResult<MemoryNode> {
        let id = read_graph(&self.graph)?.edge(relation.id)?.from;
        Ok(MemoryNode { id })
    }

    fn to_entity(&self, relation: &MemoryEdge) -> DatastoreResult<MemoryNode> {
        let id = read_graph(&self.graph)?.edge(relation.id)?.to;
        Ok(MemoryNode { id })
    }

    fn relations(
        &self,
        entity: &MemoryNode,
        relationship: &Discriminator,
        direction: Direction,
    ) -> DatastoreResult<ResultIter<MemoryEdge>> {
        let edges: Vec<MemoryEdge> = {
            let graph = read_graph(&self.graph)?;
            graph.node(entity.id)?;
            graph
                .edges
                .iter()
                .filter(|(_, e)| {
                    &e.relationship == relationship && e.endpoint(direction) == entity.id
                })
                .map(|(id, _)| MemoryEdge { id: *id })
                .collect()
        };
        self.cursor(edges)
    }
}
