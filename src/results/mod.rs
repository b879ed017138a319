//! Progressive result store.
//!
//! Three caches back the gateway's fast paths:
//! - the result cache (normalized URL → final payload, medium TTL),
//! - the preload store ((store URL, product id) → partial payload, short
//!   TTL), populated opportunistically from store-page extraction,
//! - store metadata (store URL → channel id, long TTL).
//!
//! Payloads are opaque `serde_json::Value`s; only the identifiers the
//! orchestrator routes on are inspected.

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;

// =============================================================================
// TTL cache
// =============================================================================

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// LRU cache with per-entry expiry. Expired entries are dropped lazily on
/// read; capacity eviction is the LRU's.
pub struct TtlCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock();
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: K, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.inner.lock().put(key, entry);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key).map(|e| e.value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// =============================================================================
// Result store
// =============================================================================

pub struct ResultStore {
    results: TtlCache<String, Value>,
    preloads: TtlCache<(String, String), Value>,
    store_meta: TtlCache<String, String>,
}

impl ResultStore {
    #[must_use]
    pub fn new(cfg: &CacheConfig) -> Self {
        Self {
            results: TtlCache::new(
                cfg.result_capacity,
                Duration::from_secs(cfg.result_ttl_secs),
            ),
            preloads: TtlCache::new(
                cfg.preload_capacity,
                Duration::from_secs(cfg.preload_product_ttl_secs),
            ),
            store_meta: TtlCache::new(
                cfg.preload_capacity,
                Duration::from_secs(cfg.preload_store_ttl_secs),
            ),
        }
    }

    /// Final payload for a normalized URL, if cached and fresh.
    #[must_use]
    pub fn cached_result(&self, normalized_url: &str) -> Option<Value> {
        self.results.get(&normalized_url.to_string())
    }

    /// Record a job's final payload under its normalized URL.
    pub fn record_result(&self, normalized_url: &str, payload: Value) {
        self.results.put(normalized_url.to_string(), payload);
    }

    /// Partial payload preloaded from a store page, if any.
    #[must_use]
    pub fn preload_for(&self, store_url: &str, product_id: &str) -> Option<Value> {
        self.preloads
            .get(&(store_url.to_string(), product_id.to_string()))
    }

    /// Record the product partials extracted from one store page.
    pub fn record_preloads(&self, store_url: &str, products: &serde_json::Map<String, Value>) {
        for (product_id, partial) in products {
            self.preloads.put(
                (store_url.to_string(), product_id.clone()),
                partial.clone(),
            );
        }
    }

    /// Channel id for a store URL, enabling the direct-API fast path.
    #[must_use]
    pub fn channel_id(&self, store_url: &str) -> Option<String> {
        self.store_meta.get(&store_url.to_string())
    }

    pub fn record_channel_id(&self, store_url: &str, channel_id: &str) {
        self.store_meta
            .put(store_url.to_string(), channel_id.to_string());
    }

    /// (results, preloads, store-meta) entry counts.
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.results.len(),
            self.preloads.len(),
            self.store_meta.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ResultStore {
        ResultStore::new(&CacheConfig::default())
    }

    #[test]
    fn result_round_trip() {
        let s = store();
        assert!(s.cached_result("https://shop.example.com/x").is_none());
        s.record_result("https://shop.example.com/x", json!({"foo": 1}));
        assert_eq!(
            s.cached_result("https://shop.example.com/x"),
            Some(json!({"foo": 1}))
        );
    }

    #[test]
    fn preloads_keyed_by_store_and_product() {
        let s = store();
        let mut products = serde_json::Map::new();
        products.insert("42".to_string(), json!({"name": "A"}));
        products.insert("43".to_string(), json!({"name": "B"}));
        s.record_preloads("https://shop.example.com/gadgets", &products);

        assert_eq!(
            s.preload_for("https://shop.example.com/gadgets", "42"),
            Some(json!({"name": "A"}))
        );
        assert!(s.preload_for("https://shop.example.com/other", "42").is_none());
    }

    #[test]
    fn channel_id_round_trip() {
        let s = store();
        s.record_channel_id("https://shop.example.com/gadgets", "ch9");
        assert_eq!(
            s.channel_id("https://shop.example.com/gadgets").as_deref(),
            Some("ch9")
        );
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache: TtlCache<String, u32> = TtlCache::new(8, Duration::from_millis(0));
        cache.put("k".to_string(), 7);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"k".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache: TtlCache<u32, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.put(1, 1);
        cache.put(2, 2);
        cache.get(&1);
        cache.put(3, 3);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(1));
    }
}
