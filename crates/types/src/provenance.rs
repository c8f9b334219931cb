//! Per-object provenance records.
//!
//! Every persisted object has a sibling node recording who last wrote it and
//! how. The record is deliberately small and deterministic: repeated writes
//! by the same owner produce byte-identical records, so the transaction
//! planner can skip the sibling write entirely.

use serde::{Deserialize, Serialize};

/// The kind of change that produced the current object state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The object was created by the recorded owner.
    Create,
    /// The object was last updated by the recorded owner.
    Update,
}

/// Compact provenance tuple stored alongside each object.
///
/// `serial` advances only when ownership changes hands; it is not a write
/// counter (the backend's own node version serves that purpose).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// The writer that produced the current state, if one was declared.
    pub owner: Option<String>,
    /// Whether the current state came from a create or an update.
    pub change: ChangeKind,
    /// Ownership-transition counter.
    pub serial: u64,
}

impl ProvenanceRecord {
    /// Record for a freshly created object.
    pub fn created(owner: Option<String>) -> Self {
        Self { owner, change: ChangeKind::Create, serial: 0 }
    }

    /// Record for an update, carried forward from the previous record when
    /// one exists.
    pub fn updated(previous: Option<&ProvenanceRecord>, owner: Option<String>) -> Self {
        let serial = match previous {
            Some(prev) if prev.owner == owner => prev.serial,
            Some(prev) => prev.serial + 1,
            None => 0,
        };
        Self { owner, change: ChangeKind::Update, serial }
    }
}
