//! zoom-store: a transactional object-graph store over a hierarchical
//! coordination service.
//!
//! The store persists typed objects, keeps declared cross-object reference
//! fields symmetric, applies multi-operation transactions atomically under
//! optimistic concurrency control, and delivers live change streams to
//! subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              ZoomStore (facade)             │
//! │  get │ get_all │ multi │ try_transaction    │
//! │  observable │ class_observable │ state      │
//! └──────┬──────────────┬───────────────┬───────┘
//!        │              │               │
//! ┌──────▼──────┐ ┌─────▼───────┐ ┌─────▼───────┐
//! │ Transaction │ │ Observable  │ │   State     │
//! │  snapshot,  │ │   cache     │ │ subsystem   │
//! │ plan, commit│ │ (watchers)  │ │ (keys)      │
//! └──────┬──────┘ └─────┬───────┘ └─────┬───────┘
//!        │              │               │
//! ┌──────▼──────────────▼───────────────▼───────┐
//! │    Backend (versioned KV, multi-op, watch)  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use zoom_backend::MemoryBackend;
//! # use zoom_store::{DeleteAction, ZoomBuilder};
//! # use zoom_types::StoreConfig;
//! # async fn example() -> zoom_store::Result<()> {
//! # #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! # struct Bridge;
//! # impl zoom_store::Storable for Bridge {
//! #     fn class_name() -> &'static str { "Bridge" }
//! #     fn ref_fields() -> &'static [(&'static str, zoom_store::FieldKind)] { &[] }
//! #     fn object_id(&self) -> zoom_store::ObjId { unimplemented!() }
//! #     fn ref_field(&self, _: &str) -> Option<zoom_store::RefValue> { None }
//! #     fn set_ref_field(&mut self, _: &str, _: zoom_store::RefValue) {}
//! # }
//! let backend = Arc::new(MemoryBackend::new());
//! let mut builder = ZoomBuilder::new(backend, StoreConfig::default());
//! builder.register_class::<Bridge>()?;
//! let store = builder.build().await?;
//!
//! let bridges: Vec<Bridge> = store.get_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod object;
pub mod observable;
pub mod ops;
pub mod registry;
pub mod state;
pub mod state_cache;
pub mod store;
pub mod transaction;

mod lock;
mod metrics;
mod paths;
mod retry;

pub use object::{FieldKind, RefValue, Storable};
pub use observable::{ClassObservable, ObjectObservable};
pub use ops::PersistenceOp;
pub use registry::{DeleteAction, KeyType};
pub use state::{ObjectState, StateKey, StateStorage};
pub use state_cache::CachedStateStorage;
pub use store::{ZoomBuilder, ZoomStore};
pub use transaction::Transaction;

// Re-export the types crate's commonly used items at the crate root.
pub use zoom_types::{ObjId, Result, StoreConfig, ZoomError};
