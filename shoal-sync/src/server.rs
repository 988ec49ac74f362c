//! WebSocket sync server with per-collection rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ("ideas") ── records ── BroadcastGroup
//! Client B ──┘                        │
//!                                     ├── SnapshotStore (RocksDB)
//!                                     │       │
//!                                     │       ├── Snapshots (LZ4)
//!                                     │       └── Metadata
//!                                     │
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! Each collection room maintains:
//! - The authoritative record set
//! - A `BroadcastGroup` fanning change notifications to subscribers
//! - A persisted snapshot, replaced whole on every mutation
//!
//! A mutation's change notification goes to every subscriber of the room,
//! the mutating client included — clients reconcile by re-fetching, so
//! they must observe their own writes.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use shoal_core::{sort_newest_first, unix_now, ChangeKind, Record};

use crate::broadcast::BroadcastGroup;
use crate::config::{is_placeholder, ENV_BIND_ADDR, ENV_DATA_DIR};
use crate::protocol::{MessageType, WireMessage};
use crate::storage::{SnapshotStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum subscribers per collection room
    pub max_clients_per_collection: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9620".to_string(),
            max_clients_per_collection: 100,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Resolve configuration from process environment variables.
    ///
    /// Recognized keys: `SHOAL_BIND_ADDR`, `SHOAL_DATA_DIR`. Absent or
    /// placeholder values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary key lookup (for testing).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            if !is_placeholder(&addr) {
                config.bind_addr = addr.trim().to_string();
            }
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            if !is_placeholder(&dir) {
                config.storage_path = Some(PathBuf::from(dir.trim()));
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_collections: usize,
    pub persisted_snapshots: u64,
}

/// Collection room: authoritative records + broadcast group.
struct CollectionRoom {
    /// Authoritative record set, in insertion order
    records: Vec<Record>,
    /// Broadcast group for change fan-out
    broadcast: Arc<BroadcastGroup>,
}

impl CollectionRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<String, CollectionRoom>>>;

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    /// Collection rooms: name → (records + BroadcastGroup)
    rooms: Rooms,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    /// Persistent snapshot store (optional)
    store: Option<Arc<SnapshotStore>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    ///
    /// A storage path that cannot be opened downgrades the server to
    /// in-memory operation rather than failing startup.
    pub fn new(config: ServerConfig) -> Self {
        let store = config.storage_path.as_ref().and_then(|path| {
            let store_config = StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            };
            match SnapshotStore::open(store_config) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    log::error!(
                        "Failed to open snapshot store at {}: {e}; running without persistence",
                        path.display()
                    );
                    None
                }
            }
        });

        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Recover persisted collections from storage on startup.
    ///
    /// Loads every persisted snapshot into a room so data is immediately
    /// served when clients reconnect.
    pub async fn recover(&self) -> Result<usize, Box<dyn std::error::Error>> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(0),
        };

        let names = store.list_collections()?;
        let mut recovered = 0;

        for name in &names {
            match store.load_snapshot(name) {
                Ok(records) => {
                    let mut rooms = self.rooms.write().await;
                    let room = rooms
                        .entry(name.clone())
                        .or_insert_with(|| CollectionRoom::new(self.config.broadcast_capacity));
                    room.records = records;
                    recovered += 1;
                    log::info!("Recovered collection {name} from storage");
                }
                Err(e) => log::error!("Failed to recover collection {name}: {e}"),
            }
        }

        let room_count = self.rooms.read().await.len();
        self.stats.write().await.active_collections = room_count;

        log::info!("Recovery complete: {recovered}/{} collections restored", names.len());
        Ok(recovered)
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} collections from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let store = self.store.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, rooms, stats, config, store).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        store: Option<Arc<SnapshotStore>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut client_id: Option<Uuid> = None;
        let mut joined: HashSet<String> = HashSet::new();
        let mut forwarders: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        // Room broadcasts from all joined collections merge into one queue
        let (conn_tx, mut conn_rx) = mpsc::channel::<Arc<Vec<u8>>>(config.broadcast_capacity);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match WireMessage::decode(&bytes) {
                                Ok(wire) => {
                                    {
                                        let mut s = stats.write().await;
                                        s.total_messages += 1;
                                        s.total_bytes += bytes.len() as u64;
                                    }

                                    match wire.msg_type {
                                        MessageType::Hello => {
                                            client_id = Some(wire.client_id);
                                            log::info!("Client {} joined from {addr}", wire.client_id);
                                        }

                                        MessageType::Subscribe => {
                                            let collection = wire.collection.clone();
                                            if joined.contains(&collection) {
                                                log::debug!("Client {client_id:?} already subscribed to {collection}");
                                                continue;
                                            }

                                            Self::ensure_room(&rooms, &stats, &config, store.as_ref(), &collection).await;

                                            let rooms_r = rooms.read().await;
                                            let room = match rooms_r.get(&collection) {
                                                Some(room) => room,
                                                None => continue,
                                            };

                                            if room.broadcast.client_count().await >= config.max_clients_per_collection {
                                                drop(rooms_r);
                                                log::warn!("Collection {collection} is full; refusing subscription from {addr}");
                                                let refusal = WireMessage::error(&collection, 0, format!("collection {collection} is full"));
                                                ws_sender.send(Message::Binary(refusal.encode()?.into())).await?;
                                                continue;
                                            }

                                            let mut rx = room.broadcast.add_client(wire.client_id).await;
                                            let broadcast = room.broadcast.clone();
                                            drop(rooms_r);

                                            // Forward this room's fan-out into the connection queue
                                            let tx = conn_tx.clone();
                                            let name = collection.clone();
                                            forwarders.push(tokio::spawn(async move {
                                                loop {
                                                    match rx.recv().await {
                                                        Ok(data) => {
                                                            if tx.send(data).await.is_err() {
                                                                break;
                                                            }
                                                        }
                                                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                                            log::warn!("Subscriber of {name} lagged by {n} messages");
                                                            broadcast.record_dropped(n);
                                                        }
                                                        Err(_) => break,
                                                    }
                                                }
                                            }));

                                            joined.insert(collection.clone());
                                            log::info!("Client {} subscribed to {collection}", wire.client_id);
                                        }

                                        MessageType::Query => {
                                            let collection = wire.collection.clone();
                                            Self::ensure_room(&rooms, &stats, &config, store.as_ref(), &collection).await;

                                            let reply = match wire.query_payload() {
                                                Ok(query) => {
                                                    let rooms_r = rooms.read().await;
                                                    let mut records = rooms_r
                                                        .get(&collection)
                                                        .map(|room| room.records.clone())
                                                        .unwrap_or_default();
                                                    drop(rooms_r);

                                                    sort_newest_first(&mut records);
                                                    if let Some(selection) = &query.fields {
                                                        records = records.iter().map(|r| r.project(selection)).collect();
                                                    }
                                                    if let Some(limit) = query.limit {
                                                        records.truncate(limit);
                                                    }
                                                    WireMessage::snapshot(&collection, wire.seq, records)
                                                }
                                                Err(e) => WireMessage::error(&collection, wire.seq, e.to_string()),
                                            };
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }

                                        MessageType::Insert => {
                                            let collection = wire.collection.clone();
                                            Self::ensure_room(&rooms, &stats, &config, store.as_ref(), &collection).await;

                                            let reply = match wire.insert_record() {
                                                Ok(mut record) => {
                                                    record.stamp_created_at(unix_now());
                                                    let id = record.id;

                                                    let outcome = {
                                                        let mut rooms_w = rooms.write().await;
                                                        match rooms_w.get_mut(&collection) {
                                                            Some(room) if room.records.iter().any(|r| r.id == id) => {
                                                                Err(format!("duplicate record id: {id}"))
                                                            }
                                                            Some(room) => {
                                                                room.records.push(record);
                                                                Ok((room.records.clone(), room.broadcast.clone()))
                                                            }
                                                            None => Err(format!("no room for collection {collection}")),
                                                        }
                                                    };

                                                    match outcome {
                                                        Ok((records, broadcast)) => {
                                                            Self::persist_snapshot(store.as_ref(), &stats, &collection, &records).await;
                                                            let change = WireMessage::change(&collection, ChangeKind::Insert, id);
                                                            if let Err(e) = broadcast.broadcast(&change) {
                                                                log::error!("Failed to broadcast change for {collection}: {e}");
                                                            }
                                                            WireMessage::ack(&collection, wire.seq)
                                                        }
                                                        Err(message) => WireMessage::error(&collection, wire.seq, message),
                                                    }
                                                }
                                                Err(e) => WireMessage::error(&collection, wire.seq, e.to_string()),
                                            };
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }

                                        MessageType::Update => {
                                            let collection = wire.collection.clone();
                                            Self::ensure_room(&rooms, &stats, &config, store.as_ref(), &collection).await;

                                            let reply = match wire.update_payload() {
                                                Ok(payload) => {
                                                    let outcome = {
                                                        let mut rooms_w = rooms.write().await;
                                                        match rooms_w.get_mut(&collection) {
                                                            Some(room) => {
                                                                let found = match room.records.iter_mut().find(|r| r.id == payload.id) {
                                                                    Some(record) => {
                                                                        for (key, value) in payload.fields.clone() {
                                                                            record.fields.insert(key, value);
                                                                        }
                                                                        true
                                                                    }
                                                                    None => false,
                                                                };
                                                                if found {
                                                                    Ok((room.records.clone(), room.broadcast.clone()))
                                                                } else {
                                                                    Err(format!("record not found: {}", payload.id))
                                                                }
                                                            }
                                                            None => Err(format!("record not found: {}", payload.id)),
                                                        }
                                                    };

                                                    match outcome {
                                                        Ok((records, broadcast)) => {
                                                            Self::persist_snapshot(store.as_ref(), &stats, &collection, &records).await;
                                                            let change = WireMessage::change(&collection, ChangeKind::Update, payload.id);
                                                            if let Err(e) = broadcast.broadcast(&change) {
                                                                log::error!("Failed to broadcast change for {collection}: {e}");
                                                            }
                                                            WireMessage::ack(&collection, wire.seq)
                                                        }
                                                        Err(message) => WireMessage::error(&collection, wire.seq, message),
                                                    }
                                                }
                                                Err(e) => WireMessage::error(&collection, wire.seq, e.to_string()),
                                            };
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }

                                        MessageType::Delete => {
                                            let collection = wire.collection.clone();
                                            Self::ensure_room(&rooms, &stats, &config, store.as_ref(), &collection).await;

                                            let reply = match wire.delete_id() {
                                                Ok(id) => {
                                                    let outcome = {
                                                        let mut rooms_w = rooms.write().await;
                                                        match rooms_w.get_mut(&collection) {
                                                            Some(room) => {
                                                                let before = room.records.len();
                                                                room.records.retain(|r| r.id != id);
                                                                if room.records.len() == before {
                                                                    Err(format!("record not found: {id}"))
                                                                } else {
                                                                    Ok((room.records.clone(), room.broadcast.clone()))
                                                                }
                                                            }
                                                            None => Err(format!("record not found: {id}")),
                                                        }
                                                    };

                                                    match outcome {
                                                        Ok((records, broadcast)) => {
                                                            Self::persist_snapshot(store.as_ref(), &stats, &collection, &records).await;
                                                            let change = WireMessage::change(&collection, ChangeKind::Delete, id);
                                                            if let Err(e) = broadcast.broadcast(&change) {
                                                                log::error!("Failed to broadcast change for {collection}: {e}");
                                                            }
                                                            WireMessage::ack(&collection, wire.seq)
                                                        }
                                                        Err(message) => WireMessage::error(&collection, wire.seq, message),
                                                    }
                                                }
                                                Err(e) => WireMessage::error(&collection, wire.seq, e.to_string()),
                                            };
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }

                                        MessageType::Ping => {
                                            let pong = WireMessage::pong(wire.client_id);
                                            ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                        }

                                        _ => {
                                            log::debug!("Unhandled message type: {:?}", wire.msg_type);
                                        }
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room broadcast
                msg = conn_rx.recv() => {
                    match msg {
                        Some(data) => {
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        // Cleanup: leave all rooms, persisting and removing empty ones
        for handle in forwarders {
            handle.abort();
        }
        if let Some(cid) = client_id {
            let mut rooms_w = rooms.write().await;
            for collection in &joined {
                if let Some(room) = rooms_w.get_mut(collection) {
                    room.broadcast.remove_client(&cid).await;

                    if room.broadcast.client_count().await == 0 {
                        Self::persist_snapshot(store.as_ref(), &stats, collection, &room.records).await;
                        rooms_w.remove(collection);
                        log::info!("Room {collection} removed (empty)");
                    }
                }
            }

            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_collections = rooms_w.len();
        } else {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        Ok(())
    }

    /// Get or create a room, loading any persisted snapshot on creation.
    async fn ensure_room(
        rooms: &Rooms,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
        store: Option<&Arc<SnapshotStore>>,
        collection: &str,
    ) {
        {
            let rooms_r = rooms.read().await;
            if rooms_r.contains_key(collection) {
                return;
            }
        }

        let mut rooms_w = rooms.write().await;
        // Double-check after acquiring write lock
        if rooms_w.contains_key(collection) {
            return;
        }

        let mut room = CollectionRoom::new(config.broadcast_capacity);
        if let Some(store) = store {
            match store.load_snapshot(collection) {
                Ok(records) => {
                    log::info!("Loaded persisted snapshot for collection {collection}");
                    room.records = records;
                }
                Err(crate::storage::PersistError::NotFound(_)) => {}
                Err(e) => log::error!("Failed to load snapshot for {collection}: {e}"),
            }
        }
        rooms_w.insert(collection.to_string(), room);
        let room_count = rooms_w.len();
        drop(rooms_w);

        stats.write().await.active_collections = room_count;
    }

    /// Persist a room's snapshot, if storage is configured.
    async fn persist_snapshot(
        store: Option<&Arc<SnapshotStore>>,
        stats: &Arc<RwLock<ServerStats>>,
        collection: &str,
        records: &[Record],
    ) {
        if let Some(store) = store {
            match store.save_snapshot(collection, records) {
                Ok(_) => {
                    stats.write().await.persisted_snapshots += 1;
                }
                Err(e) => log::error!("Failed to persist snapshot for {collection}: {e}"),
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<SnapshotStore>> {
        self.store.as_ref()
    }
}
