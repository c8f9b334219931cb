//! In-memory backend for testing and embedded deployments.
//!
//! All data lives in a hierarchical tree under a single lock; a global
//! atomic sequence plays the role of the coordination service's transaction
//! stamp. Watches are broadcast channels registered per path. Test hooks
//! simulate session interruption ([`MemoryBackend::interrupt_watches`]) and
//! session expiry ([`MemoryBackend::expire_ephemerals`]).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{BackendError, MultiFailure};
use crate::node::{
    ChildrenWatch, CreateMode, CreatedNode, ExistsEvent, ExistsWatch, NodeData, NodeEvent,
    NodeStat, NodeWatch, WatchStream,
};
use crate::ops::{ANY_VERSION, MultiOp, MultiResult};
use crate::{Backend, Result};

const WATCH_CHANNEL_CAPACITY: usize = 256;

/// One node in the in-memory tree.
#[derive(Debug, Clone)]
struct MemNode {
    data: Vec<u8>,
    version: i64,
    czxid: u64,
    mzxid: u64,
    ephemeral: bool,
    next_sequential: u64,
    children: BTreeMap<String, MemNode>,
}

impl MemNode {
    fn root() -> Self {
        Self {
            data: Vec::new(),
            version: 0,
            czxid: 0,
            mzxid: 0,
            ephemeral: false,
            next_sequential: 0,
            children: BTreeMap::new(),
        }
    }

    fn stat(&self) -> NodeStat {
        NodeStat { version: self.version, czxid: self.czxid, mzxid: self.mzxid }
    }
}

/// Watch notification recorded while a mutation holds the tree lock and
/// fired before the lock is released, preserving global event order.
enum Pending {
    Created { path: String, data: NodeData },
    Data { path: String, data: NodeData },
    Deleted { path: String },
    Children { parent: String },
}

/// In-memory [`Backend`] implementation.
pub struct MemoryBackend {
    tree: RwLock<MemNode>,
    zxid: AtomicU64,
    node_watches: DashMap<String, broadcast::Sender<NodeEvent>>,
    exists_watches: DashMap<String, broadcast::Sender<ExistsEvent>>,
    child_watches: DashMap<String, broadcast::Sender<Vec<String>>>,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(MemNode::root()),
            zxid: AtomicU64::new(0),
            node_watches: DashMap::new(),
            exists_watches: DashMap::new(),
            child_watches: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Drops every registered watch without touching data, simulating a
    /// session interruption. Outstanding watch streams end; subscribers are
    /// expected to re-subscribe.
    pub fn interrupt_watches(&self) {
        let node = self.node_watches.len();
        let children = self.child_watches.len();
        self.node_watches.clear();
        self.exists_watches.clear();
        self.child_watches.clear();
        debug!(node, children, "dropped all watches");
    }

    /// Removes every ephemeral node, simulating session expiry, and fires
    /// the corresponding deletion events.
    pub fn expire_ephemerals(&self) {
        let mut tree = self.tree.write();
        let mut pending = Vec::new();
        expire(&mut tree, "/", &mut pending);
        self.emit(&tree, pending);
    }

    /// Marks the backend closed; all subsequent operations fail with
    /// [`BackendError::Closed`] and outstanding watches end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.interrupt_watches();
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) { Err(BackendError::Closed) } else { Ok(()) }
    }

    fn node_sender(&self, path: &str) -> broadcast::Sender<NodeEvent> {
        self.node_watches
            .entry(path.to_owned())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn exists_sender(&self, path: &str) -> broadcast::Sender<ExistsEvent> {
        self.exists_watches
            .entry(path.to_owned())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn children_sender(&self, path: &str) -> broadcast::Sender<Vec<String>> {
        self.child_watches
            .entry(path.to_owned())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Fires recorded notifications. Called while the tree lock is held so
    /// events are observed in mutation order.
    fn emit(&self, tree: &MemNode, pending: Vec<Pending>) {
        for event in pending {
            match event {
                Pending::Created { path, data } => {
                    if let Some(tx) = self.node_watches.get(&path) {
                        let _ = tx.send(NodeEvent::Data(data));
                    }
                    if let Some(tx) = self.exists_watches.get(&path) {
                        let _ = tx.send(ExistsEvent::Created);
                    }
                },
                Pending::Data { path, data } => {
                    if let Some(tx) = self.node_watches.get(&path) {
                        let _ = tx.send(NodeEvent::Data(data));
                    }
                },
                Pending::Deleted { path } => {
                    if let Some((_, tx)) = self.node_watches.remove(&path) {
                        let _ = tx.send(NodeEvent::Deleted);
                    }
                    // Children watches on a deleted node end; subscribers
                    // re-attach and observe the absence.
                    self.child_watches.remove(&path);
                    if let Some(tx) = self.exists_watches.get(&path) {
                        let _ = tx.send(ExistsEvent::Deleted);
                    }
                },
                Pending::Children { parent } => {
                    if let Some(tx) = self.child_watches.get(&parent)
                        && let Ok(segments) = split(&parent)
                        && let Some(node) = find(tree, &segments)
                    {
                        let _ = tx.send(node.children.keys().cloned().collect());
                    }
                },
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<NodeData> {
        self.check_open()?;
        let tree = self.tree.read();
        let segments = split(path)?;
        let node = find(&tree, &segments)
            .ok_or_else(|| BackendError::NoNode { path: path.to_owned() })?;
        Ok(NodeData { data: node.data.clone(), stat: node.stat() })
    }

    async fn stat(&self, path: &str) -> Result<Option<NodeStat>> {
        self.check_open()?;
        let tree = self.tree.read();
        let segments = split(path)?;
        Ok(find(&tree, &segments).map(MemNode::stat))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let tree = self.tree.read();
        let segments = split(path)?;
        let node = find(&tree, &segments)
            .ok_or_else(|| BackendError::NoNode { path: path.to_owned() })?;
        Ok(node.children.keys().cloned().collect())
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<CreatedNode> {
        self.check_open()?;
        let mut tree = self.tree.write();
        let mut pending = Vec::new();
        let created = apply_create(&mut tree, &self.zxid, path, &data, mode, &mut pending)?;
        self.emit(&tree, pending);
        Ok(created)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>, expected_version: i64) -> Result<NodeStat> {
        self.check_open()?;
        let mut tree = self.tree.write();
        let mut pending = Vec::new();
        let stat = apply_set(&mut tree, &self.zxid, path, &data, expected_version, &mut pending)?;
        self.emit(&tree, pending);
        Ok(stat)
    }

    async fn delete(&self, path: &str, expected_version: i64) -> Result<()> {
        self.check_open()?;
        let mut tree = self.tree.write();
        let mut pending = Vec::new();
        apply_delete(&mut tree, path, expected_version, &mut pending)?;
        self.emit(&tree, pending);
        Ok(())
    }

    async fn multi(&self, ops: Vec<MultiOp>) -> Result<Vec<MultiResult>, MultiFailure> {
        if let Err(source) = self.check_open() {
            return Err(MultiFailure { index: 0, source });
        }
        let mut tree = self.tree.write();

        // Validate and apply against a scratch copy so a mid-batch failure
        // leaves the live tree untouched.
        let mut scratch = tree.clone();
        let mut pending = Vec::new();
        let mut results = Vec::with_capacity(ops.len());
        for (index, op) in ops.into_iter().enumerate() {
            let applied = match op {
                MultiOp::Create { path, data, mode } => {
                    apply_create(&mut scratch, &self.zxid, &path, &data, mode, &mut pending)
                        .map(|created| MultiResult::Created { path: created.path, stat: created.stat })
                },
                MultiOp::SetData { path, data, expected_version } => {
                    apply_set(&mut scratch, &self.zxid, &path, &data, expected_version, &mut pending)
                        .map(|stat| MultiResult::Written { stat })
                },
                MultiOp::Delete { path, expected_version } => {
                    apply_delete(&mut scratch, &path, expected_version, &mut pending)
                        .map(|()| MultiResult::Deleted)
                },
                MultiOp::Check { path, expected_version } => {
                    apply_check(&scratch, &path, expected_version).map(|()| MultiResult::Checked)
                },
            };
            match applied {
                Ok(result) => results.push(result),
                Err(source) => return Err(MultiFailure { index, source }),
            }
        }

        *tree = scratch;
        self.emit(&tree, pending);
        Ok(results)
    }

    async fn watch_node(&self, path: &str) -> Result<NodeWatch> {
        self.check_open()?;
        let tree = self.tree.read();
        let segments = split(path)?;
        let node = find(&tree, &segments)
            .ok_or_else(|| BackendError::NoNode { path: path.to_owned() })?;
        let initial = NodeData { data: node.data.clone(), stat: node.stat() };
        let receiver = self.node_sender(path).subscribe();
        Ok(NodeWatch { initial, events: WatchStream::new(receiver) })
    }

    async fn watch_exists(&self, path: &str) -> Result<ExistsWatch> {
        self.check_open()?;
        let tree = self.tree.read();
        let segments = split(path)?;
        let initial = find(&tree, &segments).map(MemNode::stat);
        let receiver = self.exists_sender(path).subscribe();
        Ok(ExistsWatch { initial, events: WatchStream::new(receiver) })
    }

    async fn watch_children(&self, path: &str) -> Result<ChildrenWatch> {
        self.check_open()?;
        let tree = self.tree.read();
        let segments = split(path)?;
        let node = find(&tree, &segments)
            .ok_or_else(|| BackendError::NoNode { path: path.to_owned() })?;
        let initial = node.children.keys().cloned().collect();
        let receiver = self.children_sender(path).subscribe();
        Ok(ChildrenWatch { initial, events: WatchStream::new(receiver) })
    }
}

// ---------------------------------------------------------------------------
// Tree navigation and mutation
// ---------------------------------------------------------------------------

fn split(path: &str) -> Result<Vec<&str>> {
    if path == "/" {
        return Ok(Vec::new());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(BackendError::InvalidPath { path: path.to_owned() });
    }
    let segments: Vec<&str> = path[1..].split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(BackendError::InvalidPath { path: path.to_owned() });
    }
    Ok(segments)
}

fn join_path(parents: &[&str], leaf: &str) -> String {
    if parents.is_empty() {
        format!("/{leaf}")
    } else {
        format!("/{}/{}", parents.join("/"), leaf)
    }
}

fn parent_path(parents: &[&str]) -> String {
    if parents.is_empty() { "/".to_owned() } else { format!("/{}", parents.join("/")) }
}

fn find<'a>(root: &'a MemNode, segments: &[&str]) -> Option<&'a MemNode> {
    let mut node = root;
    for segment in segments {
        node = node.children.get(*segment)?;
    }
    Some(node)
}

fn find_mut<'a>(root: &'a mut MemNode, segments: &[&str]) -> Option<&'a mut MemNode> {
    let mut node = root;
    for segment in segments {
        node = node.children.get_mut(*segment)?;
    }
    Some(node)
}

fn version_matches(expected: i64, actual: i64) -> bool {
    expected == ANY_VERSION || expected == actual
}

fn apply_create(
    root: &mut MemNode,
    zxid: &AtomicU64,
    path: &str,
    data: &[u8],
    mode: CreateMode,
    pending: &mut Vec<Pending>,
) -> Result<CreatedNode> {
    let segments = split(path)?;
    let Some((leaf, parents)) = segments.split_last() else {
        return Err(BackendError::InvalidPath { path: path.to_owned() });
    };
    let parent = find_mut(root, parents)
        .ok_or_else(|| BackendError::NoNode { path: parent_path(parents) })?;
    if parent.ephemeral {
        return Err(BackendError::NoChildrenForEphemerals { path: parent_path(parents) });
    }

    let name = if mode.is_sequential() {
        let sequence = parent.next_sequential;
        parent.next_sequential += 1;
        format!("{leaf}{sequence:010}")
    } else {
        (*leaf).to_owned()
    };
    let actual = join_path(parents, &name);
    if parent.children.contains_key(&name) {
        return Err(BackendError::NodeExists { path: actual });
    }

    let stamp = zxid.fetch_add(1, Ordering::SeqCst) + 1;
    let node = MemNode {
        data: data.to_vec(),
        version: 0,
        czxid: stamp,
        mzxid: stamp,
        ephemeral: mode.is_ephemeral(),
        next_sequential: 0,
        children: BTreeMap::new(),
    };
    let stat = node.stat();
    parent.children.insert(name, node);

    pending.push(Pending::Created {
        path: actual.clone(),
        data: NodeData { data: data.to_vec(), stat },
    });
    pending.push(Pending::Children { parent: parent_path(parents) });
    Ok(CreatedNode { path: actual, stat })
}

fn apply_set(
    root: &mut MemNode,
    zxid: &AtomicU64,
    path: &str,
    data: &[u8],
    expected_version: i64,
    pending: &mut Vec<Pending>,
) -> Result<NodeStat> {
    let segments = split(path)?;
    let node = find_mut(root, &segments)
        .ok_or_else(|| BackendError::NoNode { path: path.to_owned() })?;
    if !version_matches(expected_version, node.version) {
        return Err(BackendError::BadVersion { path: path.to_owned() });
    }

    node.data = data.to_vec();
    node.version += 1;
    node.mzxid = zxid.fetch_add(1, Ordering::SeqCst) + 1;
    let stat = node.stat();

    pending.push(Pending::Data {
        path: path.to_owned(),
        data: NodeData { data: data.to_vec(), stat },
    });
    Ok(stat)
}

fn apply_delete(
    root: &mut MemNode,
    path: &str,
    expected_version: i64,
    pending: &mut Vec<Pending>,
) -> Result<()> {
    let segments = split(path)?;
    let Some((leaf, parents)) = segments.split_last() else {
        return Err(BackendError::InvalidPath { path: path.to_owned() });
    };
    let parent = find_mut(root, parents)
        .ok_or_else(|| BackendError::NoNode { path: path.to_owned() })?;
    let node = parent
        .children
        .get(*leaf)
        .ok_or_else(|| BackendError::NoNode { path: path.to_owned() })?;
    if !node.children.is_empty() {
        return Err(BackendError::NotEmpty { path: path.to_owned() });
    }
    if !version_matches(expected_version, node.version) {
        return Err(BackendError::BadVersion { path: path.to_owned() });
    }

    parent.children.remove(*leaf);
    pending.push(Pending::Deleted { path: path.to_owned() });
    pending.push(Pending::Children { parent: parent_path(parents) });
    Ok(())
}

fn apply_check(root: &MemNode, path: &str, expected_version: i64) -> Result<()> {
    let segments = split(path)?;
    let node =
        find(root, &segments).ok_or_else(|| BackendError::NoNode { path: path.to_owned() })?;
    if !version_matches(expected_version, node.version) {
        return Err(BackendError::BadVersion { path: path.to_owned() });
    }
    Ok(())
}

/// Removes ephemeral children (ephemerals are always leaves) and recurses
/// into the persistent ones.
fn expire(node: &mut MemNode, path: &str, pending: &mut Vec<Pending>) {
    let expired: Vec<String> = node
        .children
        .iter()
        .filter(|(_, child)| child.ephemeral)
        .map(|(name, _)| name.clone())
        .collect();
    for name in &expired {
        node.children.remove(name);
        pending.push(Pending::Deleted { path: child_path(path, name) });
    }
    if !expired.is_empty() {
        pending.push(Pending::Children { parent: path.to_owned() });
    }
    for (name, child) in node.children.iter_mut() {
        let child_full = child_path(path, name);
        expire(child, &child_full, pending);
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" { format!("/{name}") } else { format!("{parent}/{name}") }
}
