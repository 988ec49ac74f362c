//! WebSocket store client.
//!
//! Implements the consumed store interface against a remote `SyncServer`:
//! - Request/response correlation via `seq` and oneshot channels
//! - Change notifications re-broadcast to local subscribers
//! - Bounded response timeouts
//!
//! There is no automatic reconnection: when the socket drops, pending
//! requests fail, later requests fail fast, and the change feed stays
//! silent until the application connects a fresh client. Consumers are
//! expected to fall back to manual refresh in that window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use futures_util::StreamExt;
use uuid::Uuid;

use shoal_core::{ChangeEvent, Record, StoreError};

use crate::protocol::{MessageType, QueryPayload, WireMessage};

/// How long a request waits for its correlated response.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the outgoing write queue and the local change channel.
const CHANNEL_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<WireMessage>>>>;

/// The remote store client.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct RemoteStore {
    /// Our client identity
    client_id: Uuid,

    /// Server URL
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Request sequence counter
    seq: AtomicU64,

    /// In-flight requests awaiting a correlated response
    pending: PendingMap,

    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<Vec<u8>>,

    /// Change notifications re-broadcast locally
    changes: broadcast::Sender<ChangeEvent>,

    /// Response deadline
    response_timeout: Duration,
}

impl RemoteStore {
    /// Connect to a sync server.
    ///
    /// Sends `Hello` and spawns the reader/writer tasks.
    pub async fn connect(server_url: impl Into<String>) -> Result<Self, StoreError> {
        let server_url = server_url.into();
        let client_id = Uuid::new_v4();

        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let (ws_stream, _) = tokio_tungstenite::connect_async(&server_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing queue to the socket
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            use futures_util::SinkExt;
            while let Some(data) = outgoing_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            // Queue closed: the client handle was dropped. Send a Close
            // frame so the server tears the connection down promptly.
            let _ = ws_writer
                .send(tokio_tungstenite::tungstenite::Message::Close(None))
                .await;
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);

        // Reader task: resolve pending requests, re-broadcast changes
        {
            let pending = pending.clone();
            let changes = changes.clone();
            let state = state.clone();
            let server_url = server_url.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                            let bytes: Vec<u8> = data.into();
                            match WireMessage::decode(&bytes) {
                                Ok(wire) => {
                                    Self::dispatch(wire, &pending, &changes).await;
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {server_url}: {e}");
                                }
                            }
                        }
                        Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                            break;
                        }
                        _ => {}
                    }
                }

                // Connection lost: fail everything in flight, go quiet.
                *state.write().await = ConnectionState::Disconnected;
                pending.lock().await.clear();
                log::warn!(
                    "Connection to {server_url} closed; change feed is silent until reconnect"
                );
            });
        }

        let store = Self {
            client_id,
            server_url,
            state,
            seq: AtomicU64::new(1),
            pending,
            outgoing_tx,
            changes,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        };

        store.send_raw(WireMessage::hello(client_id)).await?;
        *store.state.write().await = ConnectionState::Connected;
        log::info!("Connected to sync server at {}", store.server_url);
        Ok(store)
    }

    async fn dispatch(
        wire: WireMessage,
        pending: &PendingMap,
        changes: &broadcast::Sender<ChangeEvent>,
    ) {
        match wire.msg_type {
            MessageType::Snapshot | MessageType::Ack | MessageType::Error => {
                if wire.seq == 0 {
                    log::warn!("Uncorrelated {:?} message dropped", wire.msg_type);
                    return;
                }
                let sender = pending.lock().await.remove(&wire.seq);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(wire);
                    }
                    None => log::debug!(
                        "Late response for seq {} dropped (request timed out?)",
                        wire.seq
                    ),
                }
            }
            MessageType::Change => match wire.change_payload() {
                Ok(payload) => {
                    let event = ChangeEvent::new(wire.collection.clone(), payload.kind, payload.id);
                    // send fails only when nobody subscribed locally
                    let _ = changes.send(event);
                }
                Err(e) => log::warn!("Malformed change notification: {e}"),
            },
            MessageType::Pong => {
                log::trace!("Pong from server");
            }
            other => {
                log::debug!("Unhandled message type from server: {other:?}");
            }
        }
    }

    /// Read a snapshot of a collection.
    pub async fn query(
        &self,
        collection: &str,
        field_selection: Option<&[String]>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        let payload = QueryPayload {
            fields: field_selection.map(|f| f.to_vec()),
            limit,
        };
        let seq = self.next_seq();
        let reply = self
            .request(WireMessage::query(self.client_id, collection, seq, &payload))
            .await?;
        match reply.msg_type {
            MessageType::Snapshot => reply
                .snapshot_records()
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            MessageType::Error => Err(Self::server_error(&reply)),
            other => Err(StoreError::Deserialization(format!(
                "unexpected reply to query: {other:?}"
            ))),
        }
    }

    /// Insert a record.
    pub async fn insert(&self, collection: &str, record: Record) -> Result<(), StoreError> {
        let seq = self.next_seq();
        let msg = WireMessage::insert(self.client_id, collection, seq, record);
        self.mutate(msg).await
    }

    /// Merge partial fields into the record identified by `id`.
    pub async fn update(
        &self,
        collection: &str,
        id: Uuid,
        partial_fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let seq = self.next_seq();
        let msg = WireMessage::update(self.client_id, collection, seq, id, partial_fields);
        self.mutate(msg).await
    }

    /// Delete the record identified by `id`.
    pub async fn delete(&self, collection: &str, id: Uuid) -> Result<(), StoreError> {
        let seq = self.next_seq();
        let msg = WireMessage::delete(self.client_id, collection, seq, id);
        self.mutate(msg).await
    }

    async fn mutate(&self, msg: WireMessage) -> Result<(), StoreError> {
        let reply = self.request(msg).await?;
        match reply.msg_type {
            MessageType::Ack => Ok(()),
            MessageType::Error => Err(Self::server_error(&reply)),
            other => Err(StoreError::Deserialization(format!(
                "unexpected reply to mutation: {other:?}"
            ))),
        }
    }

    /// Ask the server to route a collection's change feed to this client.
    pub async fn subscribe_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.send_raw(WireMessage::subscribe(self.client_id, collection))
            .await
    }

    /// Subscribe to change notifications received from the server.
    ///
    /// Receivers filter by [`ChangeEvent::collection`].
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Send a heartbeat ping.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.send_raw(WireMessage::ping(self.client_id)).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get our client id.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn server_error(reply: &WireMessage) -> StoreError {
        let message = reply
            .error_message()
            .unwrap_or_else(|_| "unknown server error".to_string());
        StoreError::Backend(message)
    }

    async fn send_raw(&self, msg: WireMessage) -> Result<(), StoreError> {
        let encoded = msg
            .encode()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.outgoing_tx
            .send(encoded)
            .await
            .map_err(|_| StoreError::Connection("connection closed".to_string()))
    }

    async fn request(&self, msg: WireMessage) -> Result<WireMessage, StoreError> {
        if *self.state.read().await == ConnectionState::Disconnected {
            return Err(StoreError::Connection("not connected".to_string()));
        }

        let seq = msg.seq;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        if let Err(e) = self.send_raw(msg).await {
            self.pending.lock().await.remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Sender dropped: the reader task cleared pending on disconnect
            Ok(Err(_)) => Err(StoreError::Connection("connection closed".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                Err(StoreError::Timeout)
            }
        }
    }
}
