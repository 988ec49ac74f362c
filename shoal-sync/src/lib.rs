//! # shoal-sync — WebSocket sync backend for shoal collections
//!
//! The production Remote Store Client and its server half: clients issue
//! queries and mutations over a binary WebSocket protocol, and the server
//! pushes a change notification to every subscriber of a collection
//! whenever a mutation commits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RemoteStore │ ◄─────────────────► │ SyncServer  │
//! │ (per app)   │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ ChangeEvent │                     │ Collection  │
//! │ broadcast   │                     │ rooms       │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ SnapshotStore │
//!                                    │ (RocksDB+LZ4) │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded WireMessage)
//! - [`broadcast`] — Per-collection fan-out with backpressure
//! - [`server`] — WebSocket sync server with snapshot persistence
//! - [`client`] — WebSocket store client with request correlation
//! - [`storage`] — RocksDB-backed collection snapshots
//! - [`config`] — Environment configuration with offline fallback

pub mod broadcast;
pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use client::{ConnectionState, RemoteStore};
pub use config::{SyncConfig, ENV_BIND_ADDR, ENV_DATA_DIR, ENV_SERVER_URL};
pub use protocol::{
    ChangePayload, DeletePayload, ErrorPayload, InsertPayload, MessageType, ProtocolError,
    QueryPayload, SnapshotPayload, UpdatePayload, WireMessage,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{CollectionMetadata, PersistError, SnapshotStore, StoreConfig};
