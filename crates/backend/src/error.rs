//! Backend error types.

use snafu::Snafu;

/// Errors reported by a [`Backend`](crate::Backend) implementation.
///
/// The variants mirror the failure modes of a ZooKeeper-style coordination
/// service; the store maps them into its own error taxonomy at its boundary.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum BackendError {
    /// The node (or a required parent) does not exist.
    #[snafu(display("no node: {path}"))]
    NoNode {
        /// The missing path.
        path: String,
    },

    /// A node already exists at the path.
    #[snafu(display("node already exists: {path}"))]
    NodeExists {
        /// The conflicting path.
        path: String,
    },

    /// The expected per-node version did not match.
    #[snafu(display("version mismatch on {path}"))]
    BadVersion {
        /// The contested path.
        path: String,
    },

    /// Delete refused because the node still has children.
    #[snafu(display("node not empty: {path}"))]
    NotEmpty {
        /// The non-empty path.
        path: String,
    },

    /// Ephemeral nodes cannot have children.
    #[snafu(display("ephemeral node cannot have children: {path}"))]
    NoChildrenForEphemerals {
        /// The ephemeral parent path.
        path: String,
    },

    /// The path is not a valid absolute path.
    #[snafu(display("invalid path: {path}"))]
    InvalidPath {
        /// The rejected path.
        path: String,
    },

    /// Transient connectivity fault; the operation may be retried.
    #[snafu(display("connection to the coordination service was lost"))]
    ConnectionLoss,

    /// The session expired; ephemeral nodes owned by it are gone.
    #[snafu(display("coordination session expired"))]
    SessionExpired,

    /// The backend handle was closed.
    #[snafu(display("backend is closed"))]
    Closed,
}

impl BackendError {
    /// Whether the fault is transient and the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLoss | Self::SessionExpired)
    }
}

/// Failure of an atomic multi-op submission: the index of the first failing
/// operation together with its error. Nothing was applied.
#[derive(Debug, Clone, Snafu)]
#[snafu(display("multi-op failed at index {index}: {source}"))]
pub struct MultiFailure {
    /// Zero-based index of the failing operation.
    pub index: usize,
    /// The error reported for that operation.
    pub source: BackendError,
}
