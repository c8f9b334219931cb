//! Core types for the zoom object store.
//!
//! This crate provides the foundational pieces shared by the backend adapter
//! and the store itself:
//! - The [`ObjId`] identifier newtype
//! - The error taxonomy surfaced by the store, using snafu
//! - Postcard serialization helpers
//! - The per-object provenance record
//! - Validated configuration types

pub mod codec;
pub mod config;
pub mod error;
pub mod id;
pub mod provenance;

pub use codec::{CodecError, decode, encode};
pub use config::{ConfigError, StoreConfig};
pub use error::{Result, ZoomError};
pub use id::ObjId;
pub use provenance::{ChangeKind, ProvenanceRecord};
