//! Schema cache.
//!
//! Capacity-bounded LRU with per-entry TTL, keyed by `(server, tool)`.
//! Concurrent loads for the same key coalesce onto a single loader invocation
//! (singleflight); loader failures propagate to every waiter and are never
//! cached.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::registry::QualifiedTool;

const PRELOAD_CONCURRENCY: usize = 4;

type LoadOutput = Result<Arc<Value>, Arc<ProxyError>>;
type InflightLoad = Shared<BoxFuture<'static, LoadOutput>>;

struct SchemaEntry {
    schema: Arc<Value>,
    inserted_at: Instant,
    last_access: Instant,
    hits: u64,
}

impl SchemaEntry {
    fn new(schema: Arc<Value>) -> Self {
        let now = Instant::now();
        Self {
            schema,
            inserted_at: now,
            last_access: now,
            hits: 0,
        }
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    load_time_ms: AtomicU64,
    loads: AtomicU64,
}

impl CacheCounters {
    fn record_load(&self, elapsed: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.load_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub evictions: u64,
    /// Mean loader latency across completed loads.
    pub load_latency_ms: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.size as f64 / self.capacity as f64
    }

    pub fn request_count(&self) -> u64 {
        self.hits + self.misses
    }
}

pub struct SchemaCache {
    entries: Arc<Mutex<LruCache<QualifiedTool, SchemaEntry>>>,
    inflight: Arc<Mutex<HashMap<QualifiedTool, InflightLoad>>>,
    counters: Arc<CacheCounters>,
    ttl: Duration,
    capacity: usize,
}

impl SchemaCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = config.max_entries.max(1);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity >= 1"),
            ))),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(CacheCounters::default()),
            ttl: Duration::from_millis(config.ttl_ms),
            capacity,
        }
    }

    /// Cached schema, if present and fresh. Counts a hit or a miss.
    pub fn get_if_cached(&self, key: &QualifiedTool) -> Option<Arc<Value>> {
        let value = self.lookup_fresh(key);
        match &value {
            Some(_) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
            None => self.counters.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    /// Cached schema or the result of `loader`. At most one loader runs per
    /// key at a time; late arrivals wait on the in-flight load.
    pub async fn get_or_load<F, Fut>(&self, key: QualifiedTool, loader: F) -> ProxyResult<Arc<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ProxyResult<Value>> + Send + 'static,
    {
        if let Some(value) = self.lookup_fresh(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let load = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                existing.clone()
            } else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let future = self.spawn_load(key.clone(), loader());
                inflight.insert(key, future.clone());
                future
            }
        };

        load.await.map_err(|e| e.duplicate())
    }

    fn spawn_load(
        &self,
        key: QualifiedTool,
        load: impl std::future::Future<Output = ProxyResult<Value>> + Send + 'static,
    ) -> InflightLoad {
        let entries = Arc::clone(&self.entries);
        let inflight = Arc::clone(&self.inflight);
        let counters = Arc::clone(&self.counters);
        async move {
            // Clear the in-flight slot no matter how the load ends, including
            // abandonment by every waiter.
            let cleanup_key = key.clone();
            let cleanup_inflight = Arc::clone(&inflight);
            let _cleanup = scopeguard::guard((), move |_| {
                cleanup_inflight.lock().remove(&cleanup_key);
            });

            let started = Instant::now();
            let result = load.await;
            counters.record_load(started.elapsed());

            match result {
                Ok(schema) => {
                    let schema = Arc::new(schema);
                    let mut entries = entries.lock();
                    if let Some((displaced, _)) =
                        entries.push(key.clone(), SchemaEntry::new(Arc::clone(&schema)))
                    {
                        if displaced != key {
                            counters.evictions.fetch_add(1, Ordering::Relaxed);
                            debug!("schema cache evicted {displaced}");
                        }
                    }
                    Ok(schema)
                }
                Err(e) => Err(Arc::new(e)),
            }
        }
        .boxed()
        .shared()
    }

    /// Load many schemas with a bounded concurrency budget. A failed entry is
    /// logged and skipped; the rest stay cached. Returns the success count.
    pub async fn preload<F, Fut>(&self, keys: Vec<QualifiedTool>, loader: F) -> usize
    where
        F: Fn(QualifiedTool) -> Fut,
        Fut: std::future::Future<Output = ProxyResult<Value>> + Send + 'static,
    {
        futures::stream::iter(keys)
            .map(|key| {
                let load = loader(key.clone());
                async move {
                    match self.get_or_load(key.clone(), move || load).await {
                        Ok(_) => true,
                        Err(e) => {
                            warn!("preload of {key} failed: {e}");
                            false
                        }
                    }
                }
            })
            .buffer_unordered(PRELOAD_CONCURRENCY)
            .filter(|ok| std::future::ready(*ok))
            .count()
            .await
    }

    /// Drop every entry owned by a removed server.
    pub fn invalidate_by_server(&self, server: &str) {
        let mut entries = self.entries.lock();
        let stale: Vec<QualifiedTool> = entries
            .iter()
            .filter(|(key, _)| key.server == server)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        if !stale.is_empty() {
            debug!("invalidated {} schema(s) for removed server '{server}'", stale.len());
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn stats(&self) -> CacheStats {
        let loads = self.counters.loads.load(Ordering::Relaxed);
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            load_latency_ms: if loads == 0 {
                0
            } else {
                self.counters.load_time_ms.load(Ordering::Relaxed) / loads
            },
            size: self.entries.lock().len(),
            capacity: self.capacity,
        }
    }

    fn lookup_fresh(&self, key: &QualifiedTool) -> Option<Arc<Value>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.peek(key) {
            if entry.inserted_at.elapsed() > self.ttl {
                entries.pop(key);
                return None;
            }
        }
        entries.get_mut(key).map(|entry| {
            entry.hits += 1;
            entry.last_access = Instant::now();
            Arc::clone(&entry.schema)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn cache(max_entries: usize, ttl_ms: u64) -> SchemaCache {
        SchemaCache::new(&CacheConfig { max_entries, ttl_ms })
    }

    fn key(server: &str, tool: &str) -> QualifiedTool {
        QualifiedTool::new(server, tool)
    }

    #[tokio::test]
    async fn test_load_then_hit() {
        let cache = cache(8, 60_000);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = cache
                .get_or_load(key("fs", "read"), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"type": "object"}))
                })
                .await
                .unwrap();
            assert_eq!(*value, json!({"type": "object"}));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn test_singleflight_coalesces_concurrent_loads() {
        let cache = Arc::new(cache(8, 60_000));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(key("fs", "read"), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"schema": "read"}))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| **v == json!({"schema": "read"})));
        let stats = cache.stats();
        assert_eq!(stats.coalesced, 9);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_failures_propagate_and_are_not_cached() {
        let cache = Arc::new(cache(8, 60_000));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(key("fs", "read"), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err::<Value, _>(ProxyError::Upstream("listTools failed".into()))
                    })
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), "upstream");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.size(), 0);

        // The next call retries the loader.
        let value = cache
            .get_or_load(key("fs", "read"), || async { Ok(json!(1)) })
            .await
            .unwrap();
        assert_eq!(*value, json!(1));
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let cache = cache(2, 60_000);
        for (server, tool) in [("a", "t"), ("b", "t"), ("a", "t"), ("c", "t")] {
            cache
                .get_or_load(key(server, tool), move || async move {
                    Ok(json!({"for": "load"}))
                })
                .await
                .unwrap();
        }
        // Inserting c evicted b (a was refreshed more recently).
        assert!(cache.get_if_cached(&key("a", "t")).is_some());
        assert!(cache.get_if_cached(&key("b", "t")).is_none());
        assert!(cache.get_if_cached(&key("c", "t")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = cache(8, 1_000);
        cache
            .get_or_load(key("fs", "read"), || async { Ok(json!(1)) })
            .await
            .unwrap();
        assert!(cache.get_if_cached(&key("fs", "read")).is_some());

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(cache.get_if_cached(&key("fs", "read")).is_none());
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_constant_loader_yields_constant_values() {
        // Property: with a loader that always returns the same value, every
        // read observes that value and loader calls stay at evictions + 1.
        let cache = cache(2, 60_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let keys = [key("a", "t"), key("b", "t"), key("c", "t"), key("a", "t")];
        for k in keys {
            let calls = Arc::clone(&calls);
            let value = cache
                .get_or_load(k.clone(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("constant"))
                })
                .await
                .unwrap();
            assert_eq!(*value, json!("constant"));
        }

        let stats = cache.stats();
        assert!(calls.load(Ordering::SeqCst) as u64 <= stats.evictions + 3);
    }

    #[tokio::test]
    async fn test_invalidate_by_server() {
        let cache = cache(8, 60_000);
        for (server, tool) in [("fs", "read"), ("fs", "write"), ("db", "query")] {
            cache
                .get_or_load(key(server, tool), || async { Ok(json!({})) })
                .await
                .unwrap();
        }
        cache.invalidate_by_server("fs");
        assert!(cache.get_if_cached(&key("fs", "read")).is_none());
        assert!(cache.get_if_cached(&key("fs", "write")).is_none());
        assert!(cache.get_if_cached(&key("db", "query")).is_some());
    }

    #[tokio::test]
    async fn test_preload_partial_failure() {
        let cache = cache(8, 60_000);
        let keys = vec![key("a", "ok"), key("b", "bad"), key("c", "ok")];
        let loaded = cache
            .preload(keys, |k| async move {
                if k.name == "bad" {
                    Err(ProxyError::Upstream("nope".into()))
                } else {
                    Ok(json!({"tool": k.name}))
                }
            })
            .await;
        assert_eq!(loaded, 2);
        assert!(cache.get_if_cached(&key("a", "ok")).is_some());
        assert!(cache.get_if_cached(&key("b", "bad")).is_none());
        assert!(cache.get_if_cached(&key("c", "ok")).is_some());
    }

    #[tokio::test]
    async fn test_clear_and_stats_shape() {
        let cache = cache(4, 60_000);
        cache
            .get_or_load(key("fs", "read"), || async { Ok(json!(1)) })
            .await
            .unwrap();
        assert_eq!(cache.size(), 1);
        cache.clear();
        assert_eq!(cache.size(), 0);

        let stats = cache.stats();
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.request_count(), stats.hits + stats.misses);
        assert!(stats.utilization() <= 1.0);
    }
}
