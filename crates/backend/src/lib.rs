//! Backend abstraction for the zoom object store.
//!
//! The backend trait abstracts a hierarchical coordination service
//! (ZooKeeper-style) offering:
//!
//! - **Versioned nodes**: every node carries a per-node CAS counter plus
//!   global creation/modification counters assigned from a single sequence
//! - **Atomic multi-op**: an ordered batch that applies entirely or not at
//!   all, reporting the first failing operation
//! - **Ephemeral and sequential creation modes**
//! - **Watches**: subscription streams over a node's data, a node's
//!   existence, or a directory's membership
//!
//! [`MemoryBackend`] is a complete in-memory implementation used by tests
//! and embedded deployments; production deployments implement [`Backend`]
//! over a real coordination-service client.

pub mod error;
pub mod memory;
pub mod node;
pub mod ops;

use async_trait::async_trait;

pub use error::{BackendError, MultiFailure};
pub use memory::MemoryBackend;
pub use node::{
    ChildrenWatch, CreateMode, CreatedNode, ExistsEvent, ExistsWatch, NodeData, NodeEvent,
    NodeStat, NodeWatch, WatchStream,
};
pub use ops::{ANY_VERSION, MultiOp, MultiResult};

/// Result type for backend operations.
pub type Result<T, E = BackendError> = std::result::Result<T, E>;

/// A hierarchical versioned KV store with watches and atomic multi-op.
///
/// All paths are absolute (`/a/b/c`). Implementations must be cheap to
/// share behind an `Arc` and callable from any task.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Reads a node's data and stat.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NoNode` if the node does not exist.
    async fn get(&self, path: &str) -> Result<NodeData>;

    /// Returns the node's stat, or `None` if it does not exist.
    async fn stat(&self, path: &str) -> Result<Option<NodeStat>>;

    /// Lists the names of a node's children.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NoNode` if the node does not exist.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Creates a node, returning its actual path (sequential modes append a
    /// counter) and creation stat.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NodeExists` if the path is taken,
    /// `BackendError::NoNode` if the parent is missing, and
    /// `BackendError::NoChildrenForEphemerals` if the parent is ephemeral.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<CreatedNode>;

    /// Replaces a node's data, guarded by the expected per-node version
    /// ([`ANY_VERSION`] matches any).
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NoNode` if the node does not exist and
    /// `BackendError::BadVersion` on a version mismatch.
    async fn set_data(&self, path: &str, data: Vec<u8>, expected_version: i64) -> Result<NodeStat>;

    /// Deletes a node, guarded by the expected per-node version.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NoNode` if the node does not exist,
    /// `BackendError::BadVersion` on a version mismatch, and
    /// `BackendError::NotEmpty` if the node still has children.
    async fn delete(&self, path: &str, expected_version: i64) -> Result<()>;

    /// Applies an ordered batch of operations atomically.
    ///
    /// # Errors
    ///
    /// Returns [`MultiFailure`] naming the first failing operation; no
    /// operation is applied in that case.
    async fn multi(&self, ops: Vec<MultiOp>) -> Result<Vec<MultiResult>, MultiFailure>;

    /// Subscribes to a node's data changes, returning the current data plus
    /// an event stream. The stream yields [`NodeEvent::Deleted`] when the
    /// node is removed and simply ends when the watch is interrupted
    /// (session loss); callers decide whether to re-subscribe.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NoNode` if the node does not exist.
    async fn watch_node(&self, path: &str) -> Result<NodeWatch>;

    /// Subscribes to a node's existence transitions. Works whether or not
    /// the node currently exists.
    async fn watch_exists(&self, path: &str) -> Result<ExistsWatch>;

    /// Subscribes to a node's child membership, returning the current names
    /// plus a stream of updated listings.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NoNode` if the node does not exist.
    async fn watch_children(&self, path: &str) -> Result<ChildrenWatch>;
}
