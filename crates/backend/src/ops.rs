//! Atomic multi-op batch operations.

use crate::node::{CreateMode, NodeStat};

/// Expected-version wildcard: matches any current version.
pub const ANY_VERSION: i64 = -1;

/// One operation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum MultiOp {
    /// Create a node.
    Create {
        /// Requested path (sequential modes append a counter).
        path: String,
        /// Node payload.
        data: Vec<u8>,
        /// Creation mode.
        mode: CreateMode,
    },
    /// Replace a node's data, guarded by its expected version.
    SetData {
        /// Node path.
        path: String,
        /// New payload.
        data: Vec<u8>,
        /// Expected per-node version, or [`ANY_VERSION`].
        expected_version: i64,
    },
    /// Delete a node, guarded by its expected version.
    Delete {
        /// Node path.
        path: String,
        /// Expected per-node version, or [`ANY_VERSION`].
        expected_version: i64,
    },
    /// Assert a node exists at the expected version without modifying it.
    Check {
        /// Node path.
        path: String,
        /// Expected per-node version, or [`ANY_VERSION`].
        expected_version: i64,
    },
}

impl MultiOp {
    /// The path this operation targets.
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. }
            | Self::SetData { path, .. }
            | Self::Delete { path, .. }
            | Self::Check { path, .. } => path,
        }
    }
}

/// Per-operation result of a successful batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiResult {
    /// A node was created at the given actual path.
    Created {
        /// Full path of the created node.
        path: String,
        /// Stat at creation.
        stat: NodeStat,
    },
    /// A node's data was replaced.
    Written {
        /// Stat after the write.
        stat: NodeStat,
    },
    /// A node was deleted.
    Deleted,
    /// A check passed.
    Checked,
}
