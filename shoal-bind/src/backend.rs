//! Store backend selection.
//!
//! Bindings talk to a [`StoreBackend`], which dispatches to either the
//! process-local [`MemoryStore`] or a connected [`RemoteStore`]. Backend
//! choice happens once, at application start: a genuinely configured
//! server URL selects the remote backend; anything else (no URL, a
//! placeholder, a failed or slow connect) degrades to the in-memory
//! backend so the application starts with empty data instead of an error.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use shoal_core::{ChangeEvent, MemoryStore, Record, StoreError};
use shoal_sync::{RemoteStore, SyncConfig};

/// Bound on backend selection so consumers are never stuck waiting on a
/// misconfigured server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// A store backend: in-memory or remote.
#[derive(Clone)]
pub enum StoreBackend {
    Memory(Arc<MemoryStore>),
    Remote(Arc<RemoteStore>),
}

impl StoreBackend {
    /// Create a fresh in-memory backend.
    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemoryStore::new()))
    }

    /// Wrap an existing in-memory store.
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self::Memory(store)
    }

    /// Wrap a connected remote store.
    pub fn from_remote(store: Arc<RemoteStore>) -> Self {
        Self::Remote(store)
    }

    /// Select a backend from the environment (`SHOAL_SERVER_URL`).
    ///
    /// Never fails: a missing or placeholder URL, a connect error, or a
    /// connect timeout all degrade to the in-memory backend.
    pub async fn from_env() -> Self {
        let config = SyncConfig::from_env();
        match config.server_url {
            Some(url) => {
                match tokio::time::timeout(CONNECT_TIMEOUT, RemoteStore::connect(&url)).await {
                    Ok(Ok(remote)) => {
                        log::info!("Using remote store at {url}");
                        Self::Remote(Arc::new(remote))
                    }
                    Ok(Err(e)) => {
                        log::warn!("Connect to {url} failed: {e}; using in-memory store");
                        Self::memory()
                    }
                    Err(_) => {
                        log::warn!("Connect to {url} timed out; using in-memory store");
                        Self::memory()
                    }
                }
            }
            None => {
                log::info!("No sync server configured; using in-memory store");
                Self::memory()
            }
        }
    }

    /// Whether this backend talks to a remote server.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Read a snapshot of a collection.
    pub async fn query(
        &self,
        collection: &str,
        field_selection: Option<&[String]>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        match self {
            Self::Memory(store) => store.query(collection, field_selection, limit).await,
            Self::Remote(store) => store.query(collection, field_selection, limit).await,
        }
    }

    /// Insert a record.
    pub async fn insert(&self, collection: &str, record: Record) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.insert(collection, record).await,
            Self::Remote(store) => store.insert(collection, record).await,
        }
    }

    /// Merge partial fields into the record identified by `id`.
    pub async fn update(
        &self,
        collection: &str,
        id: Uuid,
        partial_fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.update(collection, id, partial_fields).await,
            Self::Remote(store) => store.update(collection, id, partial_fields).await,
        }
    }

    /// Delete the record identified by `id`.
    pub async fn delete(&self, collection: &str, id: Uuid) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.delete(collection, id).await,
            Self::Remote(store) => store.delete(collection, id).await,
        }
    }

    /// Subscribe to change notifications.
    ///
    /// Receivers filter by [`ChangeEvent::collection`]. For a remote
    /// backend this also asks the server to route the collection's feed
    /// to this client; a failure there is logged, not surfaced — the
    /// binding still works through manual refresh.
    pub async fn subscribe(&self, collection: &str) -> broadcast::Receiver<ChangeEvent> {
        match self {
            Self::Memory(store) => store.subscribe(),
            Self::Remote(store) => {
                if let Err(e) = store.subscribe_collection(collection).await {
                    log::warn!("Subscribe to {collection} failed: {e}");
                }
                store.subscribe()
            }
        }
    }
}

impl std::fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(_) => write!(f, "StoreBackend::Memory"),
            Self::Remote(store) => write!(f, "StoreBackend::Remote({})", store.server_url()),
        }
    }
}
