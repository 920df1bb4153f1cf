//! Hierarchical state tree with change notification.

use super::{AttributeValue, ChangeEvent, ChangeKind, NodeKind, Oid, SchemaFragment, StateError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Listener plumbing
// ============================================================================

struct ListenerEntry {
    id: u64,
    prefix: Oid,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

/// State shared by every node of one tree.
pub(crate) struct TreeShared {
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
    history_limit: usize,
}

impl TreeShared {
    /// Deliver an event to every listener whose prefix covers it.
    ///
    /// Called with the changed node's lock held.
    fn emit(&self, event: ChangeEvent) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| {
            if !event.oid.starts_with(&l.prefix) {
                return true;
            }
            l.tx.send(event.clone()).is_ok()
        });
    }

    fn unlisten(&self, id: u64) {
        self.listeners.lock().retain(|l| l.id != id);
    }
}

/// Receives change events under one OID prefix.
///
/// Dropping the listener detaches it from the tree.
pub struct Listener {
    id: u64,
    prefix: Oid,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    shared: Weak<TreeShared>,
}

impl Listener {
    /// The prefix this listener is filtered by.
    pub fn prefix(&self) -> &Oid {
        &self.prefix
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Take an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unlisten(self.id);
        }
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// A node of the tree.
#[derive(Clone)]
pub enum Node {
    Document(Arc<Document>),
    Collection(Arc<Collection>),
    Attribute(Arc<Attribute>),
}

impl Node {
    /// The node's kind.
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Document(_) => NodeKind::Document,
            Node::Collection(_) => NodeKind::Collection,
            Node::Attribute(_) => NodeKind::Attribute,
        }
    }

    /// The node's OID.
    pub fn oid(&self) -> &Oid {
        match self {
            Node::Document(d) => &d.oid,
            Node::Collection(c) => &c.oid,
            Node::Attribute(a) => &a.oid,
        }
    }

    fn new(kind: NodeKind, oid: Oid, shared: &Arc<TreeShared>) -> Node {
        match kind {
            NodeKind::Document => Node::Document(Arc::new(Document::new(oid, shared.clone()))),
            NodeKind::Collection => Node::Collection(Arc::new(Collection {
                oid,
                members: Mutex::new(BTreeMap::new()),
                shared: shared.clone(),
            })),
            NodeKind::Attribute => Node::Attribute(Arc::new(Attribute {
                oid,
                inner: Mutex::new(AttributeState::default()),
                shared: shared.clone(),
            })),
        }
    }
}

/// Tag-addressed container of child nodes.
pub struct Document {
    oid: Oid,
    children: Mutex<HashMap<u32, Node>>,
    shared: Arc<TreeShared>,
}

impl Document {
    fn new(oid: Oid, shared: Arc<TreeShared>) -> Self {
        Self {
            oid,
            children: Mutex::new(HashMap::new()),
            shared,
        }
    }

    /// This document's OID.
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Look up a child without materializing it.
    pub fn get(&self, tag: u32) -> Option<Node> {
        self.children.lock().get(&tag).cloned()
    }

    /// Child tags in ascending order.
    pub fn tags(&self) -> Vec<u32> {
        let mut tags: Vec<u32> = self.children.lock().keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Get or create the attribute child at `tag`.
    pub fn attribute(&self, tag: u32) -> Result<Arc<Attribute>, StateError> {
        match self.child(tag, NodeKind::Attribute)? {
            Node::Attribute(a) => Ok(a),
            other => Err(mismatch(&other, NodeKind::Attribute)),
        }
    }

    /// Get or create the document child at `tag`.
    pub fn document(&self, tag: u32) -> Result<Arc<Document>, StateError> {
        match self.child(tag, NodeKind::Document)? {
            Node::Document(d) => Ok(d),
            other => Err(mismatch(&other, NodeKind::Document)),
        }
    }

    /// Get or create the collection child at `tag`.
    pub fn collection(&self, tag: u32) -> Result<Arc<Collection>, StateError> {
        match self.child(tag, NodeKind::Collection)? {
            Node::Collection(c) => Ok(c),
            other => Err(mismatch(&other, NodeKind::Collection)),
        }
    }

    fn child(&self, tag: u32, kind: NodeKind) -> Result<Node, StateError> {
        let mut children = self.children.lock();
        if let Some(existing) = children.get(&tag) {
            return Ok(existing.clone());
        }
        let node = Node::new(kind, self.oid.child(tag), &self.shared);
        children.insert(tag, node.clone());
        Ok(node)
    }
}

fn mismatch(found: &Node, expected: NodeKind) -> StateError {
    StateError::KindMismatch {
        oid: found.oid().clone(),
        expected,
        found: found.kind(),
    }
}

/// Homogeneous set of documents keyed by member id.
pub struct Collection {
    oid: Oid,
    members: Mutex<BTreeMap<u32, Arc<Document>>>,
    shared: Arc<TreeShared>,
}

impl Collection {
    /// This collection's OID.
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Add a member, emitting ADDED if it did not exist yet.
    pub fn add(&self, member_id: u32) -> Arc<Document> {
        let mut members = self.members.lock();
        if let Some(existing) = members.get(&member_id) {
            return existing.clone();
        }
        let oid = self.oid.child(member_id);
        let doc = Arc::new(Document::new(oid.clone(), self.shared.clone()));
        members.insert(member_id, doc.clone());
        self.shared.emit(ChangeEvent {
            oid,
            kind: ChangeKind::Added,
            value: None,
            revision: 0,
            timestamp_ms: now_ms(),
        });
        doc
    }

    /// Remove a member, emitting REMOVED if it existed.
    pub fn remove(&self, member_id: u32) -> Option<Arc<Document>> {
        let mut members = self.members.lock();
        let removed = members.remove(&member_id)?;
        self.shared.emit(ChangeEvent {
            oid: removed.oid.clone(),
            kind: ChangeKind::Removed,
            value: None,
            revision: 0,
            timestamp_ms: now_ms(),
        });
        Some(removed)
    }

    /// Look up a member.
    pub fn get(&self, member_id: u32) -> Option<Arc<Document>> {
        self.members.lock().get(&member_id).cloned()
    }

    /// Member ids in ascending order.
    pub fn member_ids(&self) -> Vec<u32> {
        self.members.lock().keys().copied().collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    /// Whether the collection has no members.
    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

/// A previous attribute value.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub value: AttributeValue,
    pub timestamp_ms: u64,
}

/// Point-in-time view of an attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeSnapshot {
    pub value: Option<AttributeValue>,
    pub revision: u64,
    pub modified_ms: u64,
}

#[derive(Default)]
struct AttributeState {
    value: Option<AttributeValue>,
    revision: u64,
    modified_ms: u64,
    history: VecDeque<HistoryEntry>,
}

/// Typed leaf value with a revision counter.
pub struct Attribute {
    oid: Oid,
    inner: Mutex<AttributeState>,
    shared: Arc<TreeShared>,
}

impl Attribute {
    /// This attribute's OID.
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Set the value.
    ///
    /// Returns false (no revision bump, no event) if the value is unchanged.
    pub fn set(&self, value: impl Into<AttributeValue>) -> bool {
        let value = value.into();
        let mut state = self.inner.lock();
        if state.value.as_ref() == Some(&value) {
            return false;
        }

        let now = now_ms();
        if self.shared.history_limit > 0 {
            if let Some(previous) = state.value.take() {
                let timestamp_ms = state.modified_ms;
                state.history.push_back(HistoryEntry {
                    value: previous,
                    timestamp_ms,
                });
                while state.history.len() > self.shared.history_limit {
                    state.history.pop_front();
                }
            }
        }
        state.value = Some(value.clone());
        state.revision += 1;
        state.modified_ms = now;

        self.shared.emit(ChangeEvent {
            oid: self.oid.clone(),
            kind: ChangeKind::ValueChanged,
            value: Some(value),
            revision: state.revision,
            timestamp_ms: now,
        });
        true
    }

    /// Current value.
    pub fn value(&self) -> Option<AttributeValue> {
        self.inner.lock().value.clone()
    }

    /// Current revision (0 until the first set).
    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// Value, revision and modification time read atomically.
    pub fn snapshot(&self) -> AttributeSnapshot {
        let state = self.inner.lock();
        AttributeSnapshot {
            value: state.value.clone(),
            revision: state.revision,
            modified_ms: state.modified_ms,
        }
    }

    /// Retained previous values, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().history.iter().cloned().collect()
    }
}

// ============================================================================
// Tree
// ============================================================================

struct SchemaEntry {
    name: String,
    subtree: Oid,
}

/// The authoritative state tree of one instance.
pub struct StateTree {
    root: Arc<Document>,
    shared: Arc<TreeShared>,
    schema: RwLock<Vec<SchemaEntry>>,
}

impl StateTree {
    /// Create an empty tree without value history.
    pub fn new() -> Self {
        Self::with_history_limit(0)
    }

    /// Create an empty tree retaining up to `history_limit` previous
    /// values per attribute.
    pub fn with_history_limit(history_limit: usize) -> Self {
        let shared = Arc::new(TreeShared {
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            history_limit,
        });
        Self {
            root: Arc::new(Document::new(Oid::root(), shared.clone())),
            shared,
            schema: RwLock::new(Vec::new()),
        }
    }

    /// The root document.
    pub fn root(&self) -> &Arc<Document> {
        &self.root
    }

    /// Get or materialize the attribute at `oid`.
    ///
    /// Intermediate positions are documents, except directly beneath a
    /// collection where the tag is a member id.
    pub fn attribute(&self, oid: &Oid) -> Result<Arc<Attribute>, StateError> {
        match self.materialize(oid, NodeKind::Attribute)? {
            Node::Attribute(a) => Ok(a),
            other => Err(mismatch(&other, NodeKind::Attribute)),
        }
    }

    /// Get or materialize the document at `oid`.
    pub fn document(&self, oid: &Oid) -> Result<Arc<Document>, StateError> {
        if oid.is_empty() {
            return Ok(self.root.clone());
        }
        match self.materialize(oid, NodeKind::Document)? {
            Node::Document(d) => Ok(d),
            other => Err(mismatch(&other, NodeKind::Document)),
        }
    }

    /// Get or materialize the collection at `oid`.
    pub fn collection(&self, oid: &Oid) -> Result<Arc<Collection>, StateError> {
        match self.materialize(oid, NodeKind::Collection)? {
            Node::Collection(c) => Ok(c),
            other => Err(mismatch(&other, NodeKind::Collection)),
        }
    }

    /// Set the attribute at `oid`, materializing it if needed.
    pub fn set(&self, oid: &Oid, value: impl Into<AttributeValue>) -> Result<bool, StateError> {
        Ok(self.attribute(oid)?.set(value))
    }

    /// Look up a node without materializing anything.
    pub fn get(&self, oid: &Oid) -> Option<Node> {
        let mut current = Node::Document(self.root.clone());
        for &tag in oid.components() {
            current = match current {
                Node::Document(doc) => doc.get(tag)?,
                Node::Collection(col) => Node::Document(col.get(tag)?),
                Node::Attribute(_) => return None,
            };
        }
        Some(current)
    }

    /// Snapshot of the attribute at `oid`, if it exists.
    pub fn snapshot(&self, oid: &Oid) -> Option<AttributeSnapshot> {
        match self.get(oid)? {
            Node::Attribute(a) => Some(a.snapshot()),
            _ => None,
        }
    }

    /// Snapshots of every attribute at or beneath `prefix`, in OID order.
    ///
    /// A non-empty `whitelist` keeps only attributes at or beneath one of
    /// its OIDs. Nothing is materialized.
    pub fn snapshot_subtree(&self, prefix: &Oid, whitelist: &[Oid]) -> Vec<(Oid, AttributeSnapshot)> {
        let mut out = Vec::new();
        let mut pending: Vec<Node> = self.get(prefix).into_iter().collect();
        while let Some(node) = pending.pop() {
            let oid = node.oid();
            if !whitelist.is_empty() && !whitelist.iter().any(|w| w.overlaps(oid)) {
                continue;
            }
            match node {
                Node::Attribute(attr) => {
                    if whitelist.is_empty() || whitelist.iter().any(|w| attr.oid.starts_with(w)) {
                        out.push((attr.oid.clone(), attr.snapshot()));
                    }
                }
                Node::Document(doc) => {
                    let children = doc.children.lock();
                    pending.extend(children.values().cloned());
                }
                Node::Collection(col) => {
                    let members = col.members.lock();
                    pending.extend(members.values().cloned().map(Node::Document));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Attach a listener receiving every change at or beneath `prefix`.
    ///
    /// Fails for a prefix deeper than any node can be.
    pub fn listen(&self, prefix: Oid) -> Result<Listener, StateError> {
        if !prefix.is_valid_depth() {
            return Err(StateError::InvalidOid(prefix));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.lock().push(ListenerEntry {
            id,
            prefix: prefix.clone(),
            tx,
        });
        debug!(listener = id, prefix = %prefix, "State listener attached");
        Ok(Listener {
            id,
            prefix,
            rx,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.lock().len()
    }

    /// Record a plugin's owned subtrees and materialize its containers.
    ///
    /// Fails if any owned subtree overlaps one owned by another fragment.
    pub fn register_schema(&self, fragment: &SchemaFragment) -> Result<(), StateError> {
        let mut schema = self.schema.write();
        for subtree in &fragment.subtrees {
            if let Some(existing) = schema.iter().find(|e| e.subtree.overlaps(subtree)) {
                warn!(
                    fragment = %fragment.name,
                    owner = %existing.name,
                    oid = %subtree,
                    "Rejected overlapping schema fragment"
                );
                return Err(StateError::OverlappingSchema {
                    name: fragment.name.clone(),
                    owner: existing.name.clone(),
                    oid: subtree.clone(),
                });
            }
        }
        for collection in &fragment.collections {
            if !fragment.subtrees.iter().any(|s| collection.starts_with(s)) {
                return Err(StateError::OutsideSchema {
                    name: fragment.name.clone(),
                    oid: collection.clone(),
                });
            }
        }

        for subtree in &fragment.subtrees {
            self.document(subtree)?;
        }
        for collection in &fragment.collections {
            self.collection(collection)?;
        }
        for subtree in &fragment.subtrees {
            schema.push(SchemaEntry {
                name: fragment.name.clone(),
                subtree: subtree.clone(),
            });
        }
        debug!(
            fragment = %fragment.name,
            subtrees = fragment.subtrees.len(),
            "Registered schema fragment"
        );
        Ok(())
    }

    /// Name of the fragment owning `oid`, if any.
    pub fn owner_of(&self, oid: &Oid) -> Option<String> {
        self.schema
            .read()
            .iter()
            .find(|e| oid.starts_with(&e.subtree))
            .map(|e| e.name.clone())
    }

    fn materialize(&self, oid: &Oid, leaf: NodeKind) -> Result<Node, StateError> {
        let components = oid.components();
        if components.is_empty() || !oid.is_valid_depth() {
            return Err(StateError::InvalidOid(oid.clone()));
        }

        let mut current = Node::Document(self.root.clone());
        for (i, &tag) in components.iter().enumerate() {
            let last = i + 1 == components.len();
            current = match current {
                Node::Document(doc) => {
                    let kind = if last { leaf } else { NodeKind::Document };
                    doc.child(tag, kind)?
                }
                Node::Collection(col) => Node::Document(col.add(tag)),
                Node::Attribute(attr) => {
                    return Err(StateError::NotAContainer(attr.oid.clone()));
                }
            };
        }
        Ok(current)
    }
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MAX_OID_LEN;

    fn metrics_cpu() -> Oid {
        Oid::from([1000, 1, 3])
    }

    #[test]
    fn test_set_bumps_revision_and_emits_in_order() {
        let tree = StateTree::new();
        let mut listener = tree.listen(Oid::root()).unwrap();
        let attr = tree.attribute(&metrics_cpu()).unwrap();

        for i in 0..5i64 {
            assert!(attr.set(i));
        }
        assert_eq!(attr.revision(), 5);

        for i in 0..5i64 {
            let event = listener.try_recv().unwrap();
            assert_eq!(event.kind, ChangeKind::ValueChanged);
            assert_eq!(event.value, Some(AttributeValue::Integer(i)));
            assert_eq!(event.revision, (i + 1) as u64);
            assert_eq!(event.oid, metrics_cpu());
        }
        assert!(listener.try_recv().is_none());
    }

    #[test]
    fn test_unchanged_value_is_not_a_change() {
        let tree = StateTree::new();
        let mut listener = tree.listen(Oid::root()).unwrap();
        assert!(tree.set(&metrics_cpu(), 42i64).unwrap());
        assert!(!tree.set(&metrics_cpu(), 42i64).unwrap());
        assert_eq!(tree.snapshot(&metrics_cpu()).unwrap().revision, 1);
        assert!(listener.try_recv().is_some());
        assert!(listener.try_recv().is_none());
    }

    #[test]
    fn test_listener_prefix_filter() {
        let tree = StateTree::new();
        let mut metrics = tree.listen(Oid::from([1000, 1])).unwrap();
        tree.set(&Oid::from([1000, 2, 1]), "linux").unwrap();
        tree.set(&metrics_cpu(), 42i64).unwrap();

        let event = metrics.try_recv().unwrap();
        assert_eq!(event.oid, metrics_cpu());
        assert!(metrics.try_recv().is_none());
    }

    #[test]
    fn test_listener_drop_detaches() {
        let tree = StateTree::new();
        let listener = tree.listen(Oid::root()).unwrap();
        assert_eq!(tree.listener_count(), 1);
        drop(listener);
        assert_eq!(tree.listener_count(), 0);
        tree.set(&metrics_cpu(), 1i64).unwrap();
    }

    #[test]
    fn test_get_does_not_materialize() {
        let tree = StateTree::new();
        assert!(tree.get(&metrics_cpu()).is_none());
        assert!(tree.root().tags().is_empty());
        tree.set(&metrics_cpu(), 1i64).unwrap();
        assert!(matches!(tree.get(&metrics_cpu()), Some(Node::Attribute(_))));
        assert!(matches!(tree.get(&Oid::from([1000])), Some(Node::Document(_))));
    }

    #[test]
    fn test_collection_members() {
        let tree = StateTree::new();
        let mut listener = tree.listen(Oid::root()).unwrap();
        let disks = tree.collection(&Oid::from([1000, 4])).unwrap();

        // Position under a collection is a member id
        tree.set(&Oid::from([1000, 4, 7, 1]), "sda").unwrap();
        assert_eq!(disks.member_ids(), vec![7]);

        let added = listener.try_recv().unwrap();
        assert_eq!(added.kind, ChangeKind::Added);
        assert_eq!(added.oid, Oid::from([1000, 4, 7]));
        assert_eq!(listener.try_recv().unwrap().kind, ChangeKind::ValueChanged);

        assert!(disks.remove(7).is_some());
        let removed = listener.try_recv().unwrap();
        assert_eq!(removed.kind, ChangeKind::Removed);
        assert!(disks.remove(7).is_none());
        assert!(listener.try_recv().is_none());
        assert!(disks.is_empty());
    }

    #[test]
    fn test_collection_add_is_idempotent() {
        let tree = StateTree::new();
        let mut listener = tree.listen(Oid::root()).unwrap();
        let col = tree.collection(&Oid::from([2])).unwrap();
        let a = col.add(1);
        let b = col.add(1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(listener.try_recv().is_some());
        assert!(listener.try_recv().is_none());
    }

    #[test]
    fn test_kind_mismatch() {
        let tree = StateTree::new();
        tree.set(&metrics_cpu(), 1i64).unwrap();
        assert!(matches!(
            tree.document(&metrics_cpu()),
            Err(StateError::KindMismatch { .. })
        ));
        assert!(matches!(
            tree.attribute(&Oid::from([1000, 1, 3, 9])),
            Err(StateError::NotAContainer(_))
        ));
        assert!(matches!(
            tree.attribute(&Oid::root()),
            Err(StateError::InvalidOid(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        let tree = StateTree::new();
        let deepest = Oid::new(vec![1; MAX_OID_LEN]);
        tree.set(&deepest, 1i64).unwrap();
        assert_eq!(
            tree.snapshot(&deepest).and_then(|s| s.value),
            Some(AttributeValue::Integer(1))
        );

        let too_deep = Oid::new(vec![2; MAX_OID_LEN + 1]);
        assert!(matches!(
            tree.set(&too_deep, 1i64),
            Err(StateError::InvalidOid(_))
        ));
        assert!(tree.get(&Oid::from([2])).is_none());
        assert!(matches!(
            tree.listen(too_deep),
            Err(StateError::InvalidOid(_))
        ));
        assert_eq!(tree.listener_count(), 0);
    }

    #[test]
    fn test_history_timestamps_follow_previous_set() {
        let tree = StateTree::with_history_limit(4);
        let attr = tree.attribute(&metrics_cpu()).unwrap();
        attr.set(1i64);
        let first = attr.snapshot().modified_ms;
        attr.set(2i64);
        let history = attr.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, AttributeValue::Integer(1));
        assert_eq!(history[0].timestamp_ms, first);
    }

    #[test]
    fn test_snapshot_subtree() {
        let tree = StateTree::new();
        tree.set(&Oid::from([1000, 1, 3]), 42i64).unwrap();
        tree.set(&Oid::from([1000, 1, 4]), 7i64).unwrap();
        tree.set(&Oid::from([1000, 2, 1]), "host").unwrap();
        tree.set(&Oid::from([2000, 1]), true).unwrap();
        let users = tree.collection(&Oid::from([1000, 5])).unwrap();
        users.add(9).attribute(1).unwrap().set(1i64);

        let all: Vec<Oid> = tree
            .snapshot_subtree(&Oid::from([1000]), &[])
            .into_iter()
            .map(|(oid, _)| oid)
            .collect();
        assert_eq!(
            all,
            vec![
                Oid::from([1000, 1, 3]),
                Oid::from([1000, 1, 4]),
                Oid::from([1000, 2, 1]),
                Oid::from([1000, 5, 9, 1]),
            ]
        );

        let filtered = tree.snapshot_subtree(
            &Oid::from([1000]),
            &[Oid::from([1000, 1, 3]), Oid::from([1000, 5])],
        );
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].0, Oid::from([1000, 1, 3]));
        assert_eq!(filtered[0].1.value, Some(AttributeValue::Integer(42)));
        assert_eq!(filtered[1].0, Oid::from([1000, 5, 9, 1]));

        // A single attribute is its own subtree.
        assert_eq!(tree.snapshot_subtree(&Oid::from([2000, 1]), &[]).len(), 1);
        assert!(tree.snapshot_subtree(&Oid::from([3000]), &[]).is_empty());
        assert!(tree.get(&Oid::from([3000])).is_none());
    }

    #[test]
    fn test_history_retention() {
        let tree = StateTree::with_history_limit(2);
        let attr = tree.attribute(&metrics_cpu()).unwrap();
        for i in 1..=4i64 {
            attr.set(i);
        }
        let history: Vec<_> = attr.history().into_iter().map(|h| h.value).collect();
        assert_eq!(
            history,
            vec![AttributeValue::Integer(2), AttributeValue::Integer(3)]
        );
        assert_eq!(attr.value(), Some(AttributeValue::Integer(4)));
    }

    #[test]
    fn test_no_history_by_default() {
        let tree = StateTree::new();
        let attr = tree.attribute(&metrics_cpu()).unwrap();
        attr.set(1i64);
        attr.set(2i64);
        assert!(attr.history().is_empty());
    }

    #[test]
    fn test_register_schema_rejects_overlap() {
        let tree = StateTree::new();
        let shell = SchemaFragment::new("shell").subtree(Oid::from([1000, 10]));
        tree.register_schema(&shell).unwrap();
        assert_eq!(tree.owner_of(&Oid::from([1000, 10, 2])), Some("shell".into()));
        assert!(tree.owner_of(&Oid::from([1000, 11])).is_none());

        let nested = SchemaFragment::new("desktop").subtree(Oid::from([1000, 10, 5]));
        assert!(matches!(
            tree.register_schema(&nested),
            Err(StateError::OverlappingSchema { .. })
        ));
        let parent = SchemaFragment::new("device").subtree(Oid::from([1000]));
        assert!(tree.register_schema(&parent).is_err());

        let sibling = SchemaFragment::new("device").subtree(Oid::from([1000, 11]));
        tree.register_schema(&sibling).unwrap();
    }

    #[test]
    fn test_register_schema_materializes_collections() {
        let tree = StateTree::new();
        let fragment = SchemaFragment::new("filesystem")
            .subtree(Oid::from([1000, 20]))
            .collection(Oid::from([1000, 20, 1]));
        tree.register_schema(&fragment).unwrap();
        assert!(matches!(
            tree.get(&Oid::from([1000, 20, 1])),
            Some(Node::Collection(_))
        ));

        let stray = SchemaFragment::new("stray")
            .subtree(Oid::from([3]))
            .collection(Oid::from([4]));
        assert!(matches!(
            tree.register_schema(&stray),
            Err(StateError::OutsideSchema { .. })
        ));
    }

    #[test]
    fn test_concurrent_sets_keep_revision_order() {
        let tree = Arc::new(StateTree::new());
        let mut listener = tree.listen(Oid::root()).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tree = tree.clone();
                std::thread::spawn(move || {
                    for i in 0..50i64 {
                        tree.set(&metrics_cpu(), t * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut last = 0;
        let mut count = 0;
        while let Some(event) = listener.try_recv() {
            assert_eq!(event.revision, last + 1);
            last = event.revision;
            count += 1;
        }
        assert_eq!(count, 200);
        assert_eq!(tree.snapshot(&metrics_cpu()).unwrap().revision, 200);
    }
}
