//! Fan-out of change notifications to a collection's subscribers.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! subscriber gets an independent receiver that buffers up to `capacity`
//! messages before it starts lagging (backpressure).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, WireMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_clients: usize,
}

/// Atomic broadcast stats — lock-free on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single collection.
///
/// All clients subscribed to the same collection share one channel; a
/// committed mutation is fanned out to every subscriber, the mutating
/// client included — reconciliation depends on observing one's own writes.
pub struct BroadcastGroup {
    /// Broadcast channel sender (one per collection)
    sender: broadcast::Sender<Arc<Vec<u8>>>,

    /// Subscribed client ids
    clients: Arc<RwLock<HashSet<Uuid>>>,

    /// Channel capacity (messages buffered per receiver)
    capacity: usize,

    /// Lock-free stats (atomics)
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            clients: Arc::new(RwLock::new(HashSet::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a client to this group.
    ///
    /// Returns a receiver for this client to consume messages.
    pub async fn add_client(&self, client_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut clients = self.clients.write().await;
        clients.insert(client_id);
        self.sender.subscribe()
    }

    /// Remove a client from this group.
    pub async fn remove_client(&self, client_id: &Uuid) -> bool {
        let mut clients = self.clients.write().await;
        clients.remove(client_id)
    }

    /// Broadcast a message to all subscribers.
    ///
    /// The message is encoded once and shared. Returns the number of
    /// receivers that got the message. Stats are tracked via atomics —
    /// no lock acquired on the hot path.
    pub fn broadcast(&self, msg: &WireMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record a message dropped by a lagging receiver.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current subscriber count.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Check if a client is subscribed.
    pub async fn has_client(&self, client_id: &Uuid) -> bool {
        self.clients.read().await.contains(client_id)
    }

    /// Get broadcast statistics (lock-free snapshot of counters).
    pub async fn stats(&self) -> BroadcastStats {
        let clients = self.clients.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_clients: clients.len(),
        }
    }

    /// Get the channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a client id (raw receiver).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Room manager: maps collection names to broadcast groups.
///
/// Each collection gets its own group so that change notifications are
/// isolated between collections.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    /// Create a new room manager.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create a group for the given collection.
    pub async fn get_or_create(&self, collection: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(collection) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(collection) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(collection.to_string(), room.clone());
        room
    }

    /// Remove an empty room.
    pub async fn remove_if_empty(&self, collection: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(collection) {
            if room.client_count().await == 0 {
                rooms.remove(collection);
                return true;
            }
        }
        false
    }

    /// Get the number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Get all active collection names.
    pub async fn active_collections(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
