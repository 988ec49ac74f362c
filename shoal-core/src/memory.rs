//! In-memory store backend.
//!
//! The offline/development collaborator: serves the full store interface
//! against process-local state, so consumers built against a missing or
//! placeholder backend configuration see empty collections rather than
//! errors.
//!
//! Change notifications fan out over a single tokio broadcast channel;
//! subscribers filter by collection name. Stats are tracked via atomics so
//! the read path never takes an extra lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::change::{ChangeEvent, ChangeKind};
use crate::error::StoreError;
use crate::record::{sort_newest_first, unix_now, Record};

/// Default capacity of the change broadcast channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Counters for monitoring store traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub queries: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub notifications_sent: u64,
}

/// Atomic store stats — lock-free on every operation.
struct AtomicStoreStats {
    queries: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    notifications_sent: AtomicU64,
}

impl AtomicStoreStats {
    fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
        }
    }
}

/// Process-local store: named collections of records with change fan-out.
pub struct MemoryStore {
    /// Collection name → records, in insertion order
    collections: RwLock<HashMap<String, Vec<Record>>>,
    /// Change notification channel (all collections)
    changes: broadcast::Sender<ChangeEvent>,
    /// Lock-free operation counters
    stats: AtomicStoreStats,
    /// Message planted by `fail_next_query` (test seam)
    #[cfg(any(test, feature = "test-helpers"))]
    fail_next_query: std::sync::Mutex<Option<String>>,
}

impl MemoryStore {
    /// Create a store with the default change-channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a store with an explicit change-channel capacity.
    ///
    /// `capacity` bounds how many unconsumed notifications a slow
    /// subscriber may buffer before it starts lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        Self {
            collections: RwLock::new(HashMap::new()),
            changes,
            stats: AtomicStoreStats::new(),
            #[cfg(any(test, feature = "test-helpers"))]
            fail_next_query: std::sync::Mutex::new(None),
        }
    }

    /// Read a snapshot of a collection: newest-created-first, projected to
    /// `field_selection` when given, truncated to `limit` when given.
    ///
    /// An unknown collection is an empty result, not an error.
    pub async fn query(
        &self,
        collection: &str,
        field_selection: Option<&[String]>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);

        #[cfg(any(test, feature = "test-helpers"))]
        {
            let mut planted = self
                .fail_next_query
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(message) = planted.take() {
                return Err(StoreError::Backend(message));
            }
        }

        let collections = self.collections.read().await;
        let mut records = collections.get(collection).cloned().unwrap_or_default();
        drop(collections);

        sort_newest_first(&mut records);
        if let Some(selection) = field_selection {
            records = records.iter().map(|r| r.project(selection)).collect();
        }
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Insert a new record, stamping `created_at` when absent.
    pub async fn insert(&self, collection: &str, mut record: Record) -> Result<(), StoreError> {
        record.stamp_created_at(unix_now());
        let id = record.id;

        let mut collections = self.collections.write().await;
        let records = collections.entry(collection.to_string()).or_default();
        if records.iter().any(|r| r.id == id) {
            return Err(StoreError::Backend(format!("duplicate record id: {id}")));
        }
        records.push(record);
        drop(collections);

        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        self.notify(collection, ChangeKind::Insert, id);
        log::debug!("inserted record {id} into {collection}");
        Ok(())
    }

    /// Merge `partial_fields` into the record identified by `id`.
    pub async fn update(
        &self,
        collection: &str,
        id: Uuid,
        partial_fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let record = collections
            .get_mut(collection)
            .and_then(|records| records.iter_mut().find(|r| r.id == id))
            .ok_or(StoreError::NotFound(id))?;
        for (key, value) in partial_fields {
            record.fields.insert(key, value);
        }
        drop(collections);

        self.stats.updates.fetch_add(1, Ordering::Relaxed);
        self.notify(collection, ChangeKind::Update, id);
        Ok(())
    }

    /// Delete the record identified by `id`.
    pub async fn delete(&self, collection: &str, id: Uuid) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let records = collections
            .get_mut(collection)
            .ok_or(StoreError::NotFound(id))?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(StoreError::NotFound(id));
        }
        drop(collections);

        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        self.notify(collection, ChangeKind::Delete, id);
        Ok(())
    }

    /// Subscribe to change notifications for all collections.
    ///
    /// Receivers filter by [`ChangeEvent::collection`].
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Number of records currently held in a collection.
    pub async fn collection_len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, |r| r.len())
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            queries: self.stats.queries.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            updates: self.stats.updates.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            notifications_sent: self.stats.notifications_sent.load(Ordering::Relaxed),
        }
    }

    fn notify(&self, collection: &str, kind: ChangeKind, id: Uuid) {
        let event = ChangeEvent::new(collection, kind, id);
        // send fails only when nobody subscribed; that is not an error
        if self.changes.send(event).is_ok() {
            self.stats.notifications_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl MemoryStore {
    /// Arrange for the next `query` to fail with the given message.
    ///
    /// Test seam for exercising the fetch-error path without a real
    /// backend failure.
    pub fn fail_next_query(&self, message: impl Into<String>) {
        let mut planted = self
            .fail_next_query
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *planted = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn record(pairs: &[(&str, Value)]) -> Record {
        Record::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_query_unknown_collection_is_empty() {
        let store = MemoryStore::new();
        let records = store.query("ideas", None, None).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_insert_then_query() {
        let store = MemoryStore::new();
        store
            .insert("ideas", record(&[("text", json!("idea1"))]))
            .await
            .unwrap();

        let records = store.query("ideas", None, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("text"), Some(&json!("idea1")));
        // created_at stamped on insert
        assert!(records[0].created_at().is_some());
    }

    #[tokio::test]
    async fn test_query_orders_newest_first() {
        let store = MemoryStore::new();
        let mut old = record(&[("text", json!("old"))]);
        old.fields.insert("created_at".into(), json!(100));
        let mut new = record(&[("text", json!("new"))]);
        new.fields.insert("created_at".into(), json!(200));

        store.insert("ideas", old).await.unwrap();
        store.insert("ideas", new).await.unwrap();

        let records = store.query("ideas", None, None).await.unwrap();
        assert_eq!(records[0].get("text"), Some(&json!("new")));
        assert_eq!(records[1].get("text"), Some(&json!("old")));
    }

    #[tokio::test]
    async fn test_query_projection_and_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .insert(
                    "ideas",
                    record(&[("text", json!(format!("idea{i}"))), ("votes", json!(i))]),
                )
                .await
                .unwrap();
        }

        let selection = vec!["text".to_string()];
        let records = store
            .query("ideas", Some(&selection), Some(2))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].get("votes").is_none());
        assert!(records[0].get("text").is_some());
    }

    #[tokio::test]
    async fn test_insert_duplicate_id_rejected() {
        let store = MemoryStore::new();
        let rec = record(&[("text", json!("once"))]);
        let dup = Record::with_id(rec.id, Map::new());

        store.insert("ideas", rec).await.unwrap();
        let err = store.insert("ideas", dup).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = MemoryStore::new();
        let rec = record(&[("text", json!("draft")), ("votes", json!(0))]);
        let id = rec.id;
        store.insert("ideas", rec).await.unwrap();

        let mut partial = Map::new();
        partial.insert("votes".into(), json!(7));
        store.update("ideas", id, partial).await.unwrap();

        let records = store.query("ideas", None, None).await.unwrap();
        assert_eq!(records[0].get("votes"), Some(&json!(7)));
        assert_eq!(records[0].get("text"), Some(&json!("draft")));
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = MemoryStore::new();
        let err = store
            .update("ideas", Uuid::new_v4(), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        let rec = record(&[("text", json!("gone soon"))]);
        let id = rec.id;
        store.insert("ideas", rec).await.unwrap();

        store.delete("ideas", id).await.unwrap();
        assert_eq!(store.collection_len("ideas").await, 0);

        let err = store.delete("ideas", id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_subscribe_receives_change_events() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        let rec = record(&[("text", json!("idea1"))]);
        let id = rec.id;
        store.insert("ideas", rec).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.collection, "ideas");
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.id, id);

        store.delete("ideas", id).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
    }

    #[tokio::test]
    async fn test_stats_counting() {
        let store = MemoryStore::new();
        let _rx = store.subscribe();

        let rec = record(&[("text", json!("idea1"))]);
        let id = rec.id;
        store.insert("ideas", rec).await.unwrap();
        store.query("ideas", None, None).await.unwrap();
        store.query("ideas", None, None).await.unwrap();
        store.delete("ideas", id).await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.queries, 2);
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.notifications_sent, 2);
    }

    #[tokio::test]
    async fn test_no_notification_count_without_subscribers() {
        let store = MemoryStore::new();
        store
            .insert("ideas", record(&[("text", json!("idea1"))]))
            .await
            .unwrap();
        assert_eq!(store.stats().notifications_sent, 0);
    }

    #[tokio::test]
    async fn test_fail_next_query() {
        let store = MemoryStore::new();
        store
            .insert("ideas", record(&[("text", json!("idea1"))]))
            .await
            .unwrap();

        store.fail_next_query("network down");
        let err = store.query("ideas", None, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Backend error: network down");

        // Only the next query fails; data is intact afterwards
        let records = store.query("ideas", None, None).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
