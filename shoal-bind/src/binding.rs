//! Live collection bindings.
//!
//! A [`CollectionBinding`] ties a consumer to one named collection:
//!
//! - On creation it serves any warm cache entry immediately
//!   (stale-while-revalidate) and issues a background fetch.
//! - It holds exactly one change subscription; every insert/update/delete
//!   notification for its collection triggers one full re-fetch. Bursts
//!   are not coalesced.
//! - Mutations go straight to the backend and never touch local state;
//!   the change feed is the single source of truth for reconciliation.
//!
//! Per-binding states: `Loading` (no data yet) → `Ready` (data, no error)
//! → `Error` (error set, last-known records retained) → `Ready` again on
//! the next successful fetch. A binding created with `enabled: false`
//! stays idle: no fetch, no subscription, state frozen at its initial
//! value. Concurrent fetches for the same key are not ordered — the one
//! that resolves last wins, which is accepted for the low write rates
//! this layer targets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use shoal_core::{ChangeEvent, Record, StoreError};

use crate::backend::StoreBackend;
use crate::cache::{CacheKey, CollectionCache};

/// Binding parameters. Immutable once a binding is created.
#[derive(Debug, Clone)]
pub struct BindOptions {
    /// Fields to select (None = all fields)
    pub fields: Option<Vec<String>>,
    /// Row limit (None = unbounded)
    pub limit: Option<usize>,
    /// When false, the binding performs no fetch and no subscription
    pub enabled: bool,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            fields: None,
            limit: None,
            enabled: true,
        }
    }
}

/// Observable binding state.
#[derive(Debug, Clone, Default)]
pub struct BindingState {
    /// Last-known records, newest-created-first
    pub records: Vec<Record>,
    /// True until the first fetch resolves, unless a warm cache entry
    /// existed at creation
    pub loading: bool,
    /// Message of the most recent failed fetch; cleared by the next
    /// successful one
    pub error: Option<String>,
}

/// State shared between the binding handle and its background tasks.
struct BindingShared {
    backend: StoreBackend,
    cache: Arc<CollectionCache>,
    collection: String,
    options: BindOptions,
    key: CacheKey,
    state: watch::Sender<BindingState>,
    closed: AtomicBool,
}

/// A live binding to one remote collection.
///
/// Dropping the binding (or calling [`close`](Self::close)) releases the
/// subscription; in-flight fetch results arriving afterwards are
/// discarded as inert no-ops.
pub struct CollectionBinding {
    shared: Arc<BindingShared>,
    state_rx: watch::Receiver<BindingState>,
    listener: Option<tokio::task::JoinHandle<()>>,
}

impl CollectionBinding {
    /// Bind to a collection.
    ///
    /// Returns immediately; the initial state is `Ready` with stale
    /// records when the cache has a warm entry for the derived key, and
    /// `Loading` otherwise. A background fetch runs either way (unless
    /// the binding is disabled), and one change subscription is opened
    /// for the lifetime of the binding.
    pub async fn bind(
        backend: StoreBackend,
        cache: Arc<CollectionCache>,
        collection: impl Into<String>,
        options: BindOptions,
    ) -> Self {
        let collection = collection.into();
        let key = CacheKey::derive(&collection, &options);

        let warm = cache.get(&key).await;
        let loading = warm.is_none();
        let initial = BindingState {
            records: warm.unwrap_or_default(),
            loading,
            error: None,
        };
        let (state_tx, state_rx) = watch::channel(initial);

        let shared = Arc::new(BindingShared {
            backend,
            cache,
            collection,
            options,
            key,
            state: state_tx,
            closed: AtomicBool::new(false),
        });

        if !shared.options.enabled {
            log::debug!(
                "Binding for {} disabled; no fetch, no subscription",
                shared.collection
            );
            return Self {
                shared,
                state_rx,
                listener: None,
            };
        }

        // Stale-while-revalidate: fetch even on a warm cache hit
        {
            let shared = shared.clone();
            tokio::spawn(async move {
                run_fetch(&shared).await;
            });
        }

        let changes = shared.backend.subscribe(&shared.collection).await;
        let listener = {
            let shared = shared.clone();
            tokio::spawn(listen(shared, changes))
        };

        Self {
            shared,
            state_rx,
            listener: Some(listener),
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> BindingState {
        self.state_rx.borrow().clone()
    }

    /// Last-known records.
    pub fn records(&self) -> Vec<Record> {
        self.state_rx.borrow().records.clone()
    }

    /// Whether the first fetch is still outstanding.
    pub fn loading(&self) -> bool {
        self.state_rx.borrow().loading
    }

    /// Message of the most recent failed fetch, if any.
    pub fn error(&self) -> Option<String> {
        self.state_rx.borrow().error.clone()
    }

    /// A watch receiver for observing state transitions.
    pub fn watch(&self) -> watch::Receiver<BindingState> {
        self.state_rx.clone()
    }

    /// The bound collection name.
    pub fn collection(&self) -> &str {
        &self.shared.collection
    }

    /// The binding parameters.
    pub fn options(&self) -> &BindOptions {
        &self.shared.options
    }

    /// The derived cache key.
    pub fn cache_key(&self) -> &CacheKey {
        &self.shared.key
    }

    /// Manually trigger the fetch path.
    ///
    /// Safe to call at any time. Concurrent calls are not de-duplicated:
    /// each runs an independent query, and whichever resolves last wins
    /// for cache and state.
    pub async fn refresh(&self) {
        run_fetch(&self.shared).await;
    }

    /// Insert a record into the bound collection.
    ///
    /// Local state is not touched: the new record appears through the
    /// subscription-triggered re-fetch. The result is returned so callers
    /// can surface failures; discarding it gives fire-and-forget
    /// semantics, with the failure still logged here.
    pub async fn add(&self, record: Record) -> Result<(), StoreError> {
        let result = self
            .shared
            .backend
            .insert(&self.shared.collection, record)
            .await;
        if let Err(e) = &result {
            log::warn!("add to {} failed: {e}", self.shared.collection);
        }
        result
    }

    /// Apply a partial update to the record identified by `id`.
    pub async fn update(
        &self,
        id: Uuid,
        partial_fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let result = self
            .shared
            .backend
            .update(&self.shared.collection, id, partial_fields)
            .await;
        if let Err(e) = &result {
            log::warn!("update of {id} in {} failed: {e}", self.shared.collection);
        }
        result
    }

    /// Delete the record identified by `id`.
    pub async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        let result = self
            .shared
            .backend
            .delete(&self.shared.collection, id)
            .await;
        if let Err(e) = &result {
            log::warn!("remove of {id} from {} failed: {e}", self.shared.collection);
        }
        result
    }

    /// Release the subscription and stop applying fetch results.
    ///
    /// The shared cache is left untouched.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
        log::debug!("Binding for {} closed", self.shared.collection);
    }
}

impl Drop for CollectionBinding {
    fn drop(&mut self) {
        self.close();
    }
}

/// One fetch cycle: query, then apply to cache and state.
///
/// Results arriving after close are discarded without touching state.
/// A failed fetch keeps the last-known records (stale data beats a blank
/// screen) and records the error; loading always resolves.
async fn run_fetch(shared: &BindingShared) {
    let result = shared
        .backend
        .query(
            &shared.collection,
            shared.options.fields.as_deref(),
            shared.options.limit,
        )
        .await;

    if shared.closed.load(Ordering::Relaxed) {
        log::debug!(
            "Discarding fetch result for {}: binding closed",
            shared.collection
        );
        return;
    }

    match result {
        Ok(records) => {
            shared.cache.set(shared.key.clone(), records.clone()).await;
            shared.state.send_modify(|state| {
                state.records = records;
                state.loading = false;
                state.error = None;
            });
        }
        Err(e) => {
            log::warn!("Fetch for {} failed: {e}", shared.collection);
            shared.state.send_modify(|state| {
                state.loading = false;
                state.error = Some(e.to_string());
            });
        }
    }
}

/// Subscription loop: one full re-fetch per change notification.
async fn listen(shared: Arc<BindingShared>, mut changes: broadcast::Receiver<ChangeEvent>) {
    loop {
        match changes.recv().await {
            Ok(event) if event.collection == shared.collection => {
                if shared.closed.load(Ordering::Relaxed) {
                    break;
                }
                log::trace!("Change {:?} on {}; re-fetching", event.kind, shared.collection);
                run_fetch(&shared).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // Missed notifications; one re-fetch resynchronizes
                log::warn!(
                    "Change feed for {} lagged by {n} events; re-fetching",
                    shared.collection
                );
                run_fetch(&shared).await;
            }
            Err(broadcast::error::RecvError::Closed) => {
                // No automatic resubscription: the feed stays silent until
                // the consumer reconnects or calls refresh()
                log::debug!("Change feed for {} closed", shared.collection);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shoal_core::MemoryStore;
    use std::time::Duration;

    fn record(pairs: &[(&str, serde_json::Value)]) -> Record {
        Record::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    async fn wait_until<F: Fn(&BindingState) -> bool>(
        binding: &CollectionBinding,
        predicate: F,
    ) -> BindingState {
        let mut rx = binding.watch();
        loop {
            {
                let state = rx.borrow();
                if predicate(&state) {
                    return state.clone();
                }
            }
            tokio::time::timeout(Duration::from_secs(2), rx.changed())
                .await
                .expect("timed out waiting for state transition")
                .expect("state channel closed");
        }
    }

    fn setup() -> (Arc<MemoryStore>, StoreBackend, Arc<CollectionCache>) {
        let store = Arc::new(MemoryStore::new());
        let backend = StoreBackend::from_memory(store.clone());
        let cache = Arc::new(CollectionCache::new());
        (store, backend, cache)
    }

    #[tokio::test]
    async fn test_bind_empty_collection() {
        let (_store, backend, cache) = setup();
        let binding =
            CollectionBinding::bind(backend, cache, "ideas", BindOptions::default()).await;

        let state = wait_until(&binding, |s| !s.loading).await;
        assert!(state.records.is_empty());
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_cold_mount_starts_empty() {
        let (_store, backend, cache) = setup();
        let binding =
            CollectionBinding::bind(backend, cache, "ideas", BindOptions::default()).await;
        // No warm cache entry existed: records start empty with no error.
        // The background fetch may already have resolved, so loading is
        // only asserted once it settles.
        let state = binding.state();
        assert!(state.records.is_empty());
        assert!(state.error.is_none());
        let state = wait_until(&binding, |s| !s.loading).await;
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_warm_mount_serves_stale_immediately() {
        let (store, backend, cache) = setup();
        store
            .insert("ideas", record(&[("text", json!("idea1"))]))
            .await
            .unwrap();

        // First binding warms the cache
        let first = CollectionBinding::bind(
            backend.clone(),
            cache.clone(),
            "ideas",
            BindOptions::default(),
        )
        .await;
        wait_until(&first, |s| !s.loading).await;

        // Second binding with the same parameters mounts Ready
        let second =
            CollectionBinding::bind(backend, cache, "ideas", BindOptions::default()).await;
        let state = second.state();
        assert!(!state.loading);
        assert_eq!(state.records.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_binding_makes_no_calls() {
        let (store, backend, cache) = setup();
        let options = BindOptions {
            enabled: false,
            ..BindOptions::default()
        };
        let binding = CollectionBinding::bind(backend, cache, "ideas", options).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = binding.state();
        assert!(state.records.is_empty());
        // Initial value retained: no cache entry existed, so loading stays true
        assert!(state.loading);
        assert!(state.error.is_none());
        assert_eq!(store.stats().queries, 0);
    }

    #[tokio::test]
    async fn test_subscription_triggers_exactly_one_fetch() {
        let (store, backend, cache) = setup();
        let binding =
            CollectionBinding::bind(backend, cache, "ideas", BindOptions::default()).await;
        wait_until(&binding, |s| !s.loading).await;

        let baseline = store.stats().queries;
        binding
            .add(record(&[("text", json!("idea1"))]))
            .await
            .unwrap();

        let state = wait_until(&binding, |s| !s.records.is_empty()).await;
        assert_eq!(state.records.len(), 1);
        assert_eq!(state.records[0].get("text"), Some(&json!("idea1")));
        assert_eq!(store.stats().queries, baseline + 1);
    }

    #[tokio::test]
    async fn test_fetch_error_retains_records() {
        let (store, backend, cache) = setup();
        store
            .insert("ideas", record(&[("text", json!("idea1"))]))
            .await
            .unwrap();
        store
            .insert("ideas", record(&[("text", json!("idea2"))]))
            .await
            .unwrap();

        let binding =
            CollectionBinding::bind(backend, cache, "ideas", BindOptions::default()).await;
        let state = wait_until(&binding, |s| !s.loading).await;
        assert_eq!(state.records.len(), 2);

        store.fail_next_query("network down");
        binding.refresh().await;

        let state = wait_until(&binding, |s| s.error.is_some()).await;
        assert!(state.error.as_deref().unwrap().contains("network down"));
        assert!(!state.loading);
        // Last-known records retained
        assert_eq!(state.records.len(), 2);
    }

    #[tokio::test]
    async fn test_error_cleared_on_next_success() {
        let (store, backend, cache) = setup();
        let binding =
            CollectionBinding::bind(backend, cache, "ideas", BindOptions::default()).await;
        wait_until(&binding, |s| !s.loading).await;

        store.fail_next_query("blip");
        binding.refresh().await;
        wait_until(&binding, |s| s.error.is_some()).await;

        binding.refresh().await;
        let state = wait_until(&binding, |s| s.error.is_none()).await;
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_refresh_idempotent_without_changes() {
        let (_store, backend, cache) = setup();
        let binding =
            CollectionBinding::bind(backend, cache, "ideas", BindOptions::default()).await;
        let before = wait_until(&binding, |s| !s.loading).await;

        binding.refresh().await;
        let after = binding.state();
        assert_eq!(after.records, before.records);
        assert_eq!(after.error, before.error);
        assert_eq!(after.loading, before.loading);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_not_deduplicated() {
        let (store, backend, cache) = setup();
        let binding =
            CollectionBinding::bind(backend, cache, "ideas", BindOptions::default()).await;
        wait_until(&binding, |s| !s.loading).await;

        let baseline = store.stats().queries;
        tokio::join!(binding.refresh(), binding.refresh());
        assert_eq!(store.stats().queries, baseline + 2);
    }

    #[tokio::test]
    async fn test_closed_binding_discards_fetch_results() {
        let (store, backend, cache) = setup();
        let mut binding = CollectionBinding::bind(
            backend,
            cache,
            "ideas",
            BindOptions::default(),
        )
        .await;
        wait_until(&binding, |s| !s.loading).await;
        let before = binding.state();

        binding.close();
        store
            .insert("ideas", record(&[("text", json!("late"))]))
            .await
            .unwrap();
        binding.refresh().await;

        let after = binding.state();
        assert_eq!(after.records, before.records);
    }

    #[tokio::test]
    async fn test_mutation_errors_returned() {
        let (_store, backend, cache) = setup();
        let binding =
            CollectionBinding::bind(backend, cache, "ideas", BindOptions::default()).await;
        wait_until(&binding, |s| !s.loading).await;

        let missing = Uuid::new_v4();
        let err = binding.update(missing, serde_json::Map::new()).await;
        assert!(matches!(err, Err(StoreError::NotFound(_))));

        let err = binding.remove(missing).await;
        assert!(matches!(err, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_options_limit_and_projection() {
        let (store, backend, cache) = setup();
        for i in 0..5 {
            let mut rec = record(&[("text", json!(format!("idea{i}"))), ("votes", json!(i))]);
            rec.fields.insert("created_at".into(), json!(100 + i));
            store.insert("ideas", rec).await.unwrap();
        }

        let options = BindOptions {
            fields: Some(vec!["text".into()]),
            limit: Some(3),
            enabled: true,
        };
        let binding = CollectionBinding::bind(backend, cache, "ideas", options).await;
        let state = wait_until(&binding, |s| !s.loading).await;

        assert_eq!(state.records.len(), 3);
        // Newest first
        assert_eq!(state.records[0].get("text"), Some(&json!("idea4")));
        // Projection applied
        assert!(state.records[0].get("votes").is_none());
    }
}
