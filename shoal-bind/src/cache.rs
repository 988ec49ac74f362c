//! Injectable snapshot cache.
//!
//! One `CollectionCache` is constructed at application start and shared by
//! reference with every binding. Entries are keyed deterministically by
//! (collection, field selection, row limit), replaced whole on every
//! successful fetch, and never evicted — they live as long as the cache.
//!
//! Two bindings with the same key share an entry, which is what makes a
//! remount render instantly from stale data while revalidation runs.

use std::collections::HashMap;
use tokio::sync::RwLock;

use shoal_core::Record;

use crate::binding::BindOptions;

/// Deterministic cache key over a binding's parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a (collection, options) pair.
    pub fn derive(collection: &str, options: &BindOptions) -> Self {
        let fields = options
            .fields
            .as_ref()
            .map_or_else(|| "*".to_string(), |f| f.join(","));
        let limit = options
            .limit
            .map_or_else(|| "all".to_string(), |n| n.to_string());
        Self(format!("{collection}|{fields}|{limit}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared snapshot cache: cache key → last-known records.
pub struct CollectionCache {
    entries: RwLock<HashMap<CacheKey, Vec<Record>>>,
}

impl CollectionCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the cached snapshot for a key, if one exists.
    pub async fn get(&self, key: &CacheKey) -> Option<Vec<Record>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Replace the snapshot for a key.
    pub async fn set(&self, key: CacheKey, records: Vec<Record>) {
        self.entries.write().await.insert(key, records);
    }

    /// Whether a warm entry exists for a key.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop all entries (controlled teardown in tests).
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

impl Default for CollectionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_deterministic() {
        let options = BindOptions {
            fields: Some(vec!["text".into(), "votes".into()]),
            limit: Some(20),
            enabled: true,
        };
        let a = CacheKey::derive("ideas", &options);
        let b = CacheKey::derive("ideas", &options);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "ideas|text,votes|20");
    }

    #[test]
    fn test_key_distinguishes_parameters() {
        let defaults = BindOptions::default();
        let limited = BindOptions {
            limit: Some(5),
            ..BindOptions::default()
        };
        let selected = BindOptions {
            fields: Some(vec!["text".into()]),
            ..BindOptions::default()
        };

        let base = CacheKey::derive("ideas", &defaults);
        assert_ne!(base, CacheKey::derive("clients", &defaults));
        assert_ne!(base, CacheKey::derive("ideas", &limited));
        assert_ne!(base, CacheKey::derive("ideas", &selected));
        assert_eq!(base.as_str(), "ideas|*|all");
    }

    #[test]
    fn test_enabled_does_not_affect_key() {
        let on = BindOptions::default();
        let off = BindOptions {
            enabled: false,
            ..BindOptions::default()
        };
        assert_eq!(CacheKey::derive("ideas", &on), CacheKey::derive("ideas", &off));
    }

    #[tokio::test]
    async fn test_set_replaces_whole_entry() {
        let cache = CollectionCache::new();
        let key = CacheKey::derive("ideas", &BindOptions::default());

        assert!(cache.get(&key).await.is_none());

        let first = vec![Record::new(serde_json::Map::new())];
        cache.set(key.clone(), first.clone()).await;
        assert_eq!(cache.get(&key).await, Some(first));

        let second: Vec<Record> = Vec::new();
        cache.set(key.clone(), second.clone()).await;
        assert_eq!(cache.get(&key).await, Some(second));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = CollectionCache::new();
        let key = CacheKey::derive("ideas", &BindOptions::default());
        cache.set(key.clone(), Vec::new()).await;
        assert!(cache.contains(&key).await);

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert!(!cache.contains(&key).await);
    }
}
