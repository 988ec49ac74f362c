//! # shoal-bind — live collection bindings for shoal
//!
//! Binds application state to named remote collections with caching and
//! realtime reconciliation: a binding serves the last-known snapshot
//! immediately, revalidates in the background, and re-fetches whenever the
//! store pushes a change notification for its collection.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐   state (watch)   ┌──────────────────┐
//! │ CollectionBinding  │ ────────────────► │ UI / consumer    │
//! │  per collection    │                   └──────────────────┘
//! └───┬────────┬───────┘
//!     │        │ query / insert / update / delete
//!     │        ▼
//!     │   ┌──────────────┐      ┌───────────────────────┐
//!     │   │ StoreBackend │ ───► │ MemoryStore │ Remote  │
//!     │   └──────────────┘      └───────────────────────┘
//!     │        ▲
//!     │        │ ChangeEvent (broadcast)
//!     └────────┘
//!          │
//!          ▼
//! ┌────────────────────┐
//! │ CollectionCache    │  shared snapshot cache (injected)
//! └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`backend`] — Store backend selection (in-memory vs remote)
//! - [`cache`] — Injectable snapshot cache with deterministic keys
//! - [`binding`] — The live binding: fetch, subscribe, mutate, refresh

pub mod backend;
pub mod binding;
pub mod cache;

// Re-exports for convenience
pub use backend::StoreBackend;
pub use binding::{BindOptions, BindingState, CollectionBinding};
pub use cache::{CacheKey, CollectionCache};
