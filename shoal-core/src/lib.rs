//! # shoal-core — record model and store primitives for shoal
//!
//! Defines the pieces every store backend shares: the schemaless [`Record`]
//! model, the [`ChangeEvent`] push notification, the [`StoreError`] boundary
//! error, and the in-memory [`MemoryStore`] backend used for local and
//! offline development.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   query/insert/…   ┌──────────────┐
//! │ shoal-bind   │ ─────────────────► │ MemoryStore  │
//! │ (bindings)   │                    │ (in-process) │
//! └──────┬───────┘                    └──────┬───────┘
//!        │          ChangeEvent              │
//!        ◄────────────────────────────────────
//!              (tokio broadcast channel)
//! ```
//!
//! The production WebSocket backend lives in `shoal-sync` and speaks the
//! same types defined here.

pub mod change;
pub mod error;
pub mod memory;
pub mod record;

// Re-exports for convenience
pub use change::{ChangeEvent, ChangeKind};
pub use error::StoreError;
pub use memory::{MemoryStore, StoreStats};
pub use record::{sort_newest_first, unix_now, Record, CREATED_AT_FIELD};
