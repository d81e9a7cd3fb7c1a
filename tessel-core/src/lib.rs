//! # tessel-core — local-first reactive document runtime
//!
//! A room is one replicated document made of typed collections (sequences,
//! maps, texts) addressed by path. Views observe paths and get a fresh plain
//! snapshot after every commit that touches them; mutations are batched in
//! transactions and written behind to RocksDB.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ observe  ┌──────────────┐ transact ┌─────────────┐
//! │ View code   │ ───────► │ Observation  │ ───────► │ Document    │
//! │             │ ◄─────── │ (binding)    │          │ (runtime)   │
//! └─────────────┘  pushes  └──────────────┘          └──────┬──────┘
//!                                                           │ ops
//!                                                    ┌──────┴──────┐
//!                                                    │ Engine (yrs)│
//!                                                    └──────┬──────┘
//!                                                           │ update_v1
//!                                                    ┌──────┴──────┐
//!                                                    │ DurableStore│ ──► tessel-store
//!                                                    └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`schema`] — declared paths and their collection kinds
//! - [`engine`] — `yrs`-backed collections, staged operations, replay
//! - [`persist`] — writer thread, strict log loading, durability events
//! - [`runtime`] — documents, transactions, handles, room registry
//! - [`binding`] — observations and their lifecycle
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tessel_core::{CollectionKind, Document, DocumentConfig, Error, Schema};
//!
//! # async fn run() -> Result<(), Error> {
//! let schema = Arc::new(Schema::builder().sequence("notes").build()?);
//! let doc = Document::open_ready("inbox", schema, DocumentConfig::default()).await?;
//!
//! let notes = doc.observe("notes", CollectionKind::Sequence)?;
//! let handle = doc.sequence("notes")?;
//! doc.transact(|tx| {
//!     tx.sequence(&handle)?.push(json!({"id": "n1", "title": "New Note"}));
//!     Ok::<_, Error>(())
//! })?;
//! assert_eq!(notes.push_count(), 1);
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod engine;
pub mod error;
pub mod persist;
pub mod runtime;
pub mod schema;

// Re-exports for convenience
pub use binding::{Observation, Observed};
pub use engine::ops::{Operation, TxId};
pub use error::{DecodeError, Error, Result, SchemaError};
pub use persist::{StoreEvent, SyncOutcome};
pub use runtime::handle::{CollectionHandle, MapHandle, SequenceHandle, TextHandle};
pub use runtime::rooms::RoomRegistry;
pub use runtime::transaction::{MapView, SequenceView, TextView, Transaction};
pub use runtime::{Document, DocumentConfig};
pub use schema::{CollectionKind, Declaration, FieldShape, Schema, SchemaBuilder};
pub use tessel_store::StoreConfig;
