//! # tessel-store — durable byte storage for Tessel rooms
//!
//! Engine-agnostic persistence for room documents. Nothing in this crate
//! knows what a commit contains; it stores framed, checksummed, compressed
//! byte records in commit order and hands them back in the same order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  entries   ┌───────────────┐  batch   ┌──────────────────┐
//! │ commit bytes │ ─────────► │ WriteAheadLog │ ───────► │ RoomStore        │
//! │ (per room)   │            │ (buffer+CRC)  │          │ (RocksDB)        │
//! └──────────────┘            └───────────────┘          └────────┬─────────┘
//!                                                                 │
//!                                          ┌──────────────────────┴──────────┐
//!                                          │ CF "snapshots" — compacted state │
//!                                          │ CF "deltas"    — commit log      │
//!                                          │ CF "metadata"  — room metadata   │
//!                                          └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`room`] — stable room keys derived from room names
//! - [`wal`] — log entry framing, checksums and the write buffer
//! - [`delta`] — LZ4 compression and compaction bookkeeping
//! - [`rocks`] — the RocksDB-backed [`RoomStore`]

pub mod delta;
pub mod rocks;
pub mod room;
pub mod wal;

pub use delta::{CompressedDelta, DeltaError, DeltaLog, DeltaStats};
pub use rocks::{RoomMetadata, RoomStore, StoreConfig, StoreError, StoredRoom};
pub use room::RoomKey;
pub use wal::{WalConfig, WalEntry, WalEntryType, WalError, WriteAheadLog};
