//! Node metadata, creation modes, and watch primitives.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Per-node metadata.
///
/// `version` is the per-node CAS counter (starts at 0, bumps on every data
/// write). `czxid` and `mzxid` are creation and last-modification stamps
/// drawn from a single backend-wide sequence; they give transactions their
/// global snapshot bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Per-node data version.
    pub version: i64,
    /// Global sequence value at node creation.
    pub czxid: u64,
    /// Global sequence value at the last data write.
    pub mzxid: u64,
}

/// A node's data together with its stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    /// The node payload.
    pub data: Vec<u8>,
    /// The node stat at read time.
    pub stat: NodeStat,
}

/// Node creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives until deleted.
    Persistent,
    /// Removed when the owning session ends.
    Ephemeral,
    /// Persistent, with a zero-padded counter appended to the name.
    PersistentSequential,
    /// Ephemeral, with a zero-padded counter appended to the name.
    EphemeralSequential,
}

impl CreateMode {
    /// Whether nodes created in this mode are tied to the session.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    /// Whether the backend appends a sequence counter to the name.
    pub fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Result of a create: the actual path (sequential modes differ from the
/// requested one) and the creation stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedNode {
    /// Full path of the created node.
    pub path: String,
    /// Stat at creation time.
    pub stat: NodeStat,
}

/// Event on a watched node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The node's data changed; carries the new data and stat.
    Data(NodeData),
    /// The node was deleted. Terminal for this node's watch.
    Deleted,
}

/// Event on a watched path's existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistsEvent {
    /// A node appeared at the path.
    Created,
    /// The node at the path was removed.
    Deleted,
}

/// A node-data subscription: the data at subscribe time plus the event
/// stream.
pub struct NodeWatch {
    /// Node data at subscription time.
    pub initial: NodeData,
    /// Subsequent events. Ends without a [`NodeEvent::Deleted`] when the
    /// watch is interrupted.
    pub events: WatchStream<NodeEvent>,
}

/// An existence subscription.
pub struct ExistsWatch {
    /// The node's stat at subscription time, if it exists.
    pub initial: Option<NodeStat>,
    /// Subsequent existence transitions.
    pub events: WatchStream<ExistsEvent>,
}

/// A child-membership subscription: the names at subscribe time plus a
/// stream of updated listings.
pub struct ChildrenWatch {
    /// Child names at subscription time.
    pub initial: Vec<String>,
    /// Updated listings after every membership change.
    pub events: WatchStream<Vec<String>>,
}

/// Stream adapter over a broadcast subscription.
///
/// The stream ends when the backend drops the watch (session interruption
/// or close) and also when the subscriber lags far enough to lose events.
/// In both cases the subscriber's view is stale and it must re-subscribe to
/// resynchronize.
pub struct WatchStream<T> {
    inner: BroadcastStream<T>,
}

impl<T: Clone + Send + 'static> WatchStream<T> {
    pub(crate) fn new(receiver: tokio::sync::broadcast::Receiver<T>) -> Self {
        Self { inner: BroadcastStream::new(receiver) }
    }
}

impl<T: Clone + Send + 'static> Stream for WatchStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(event)),
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => Poll::Ready(None),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
