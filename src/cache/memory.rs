//! In-process fast cache layer
//!
//! TTL-bounded key/value store with LRU eviction, shared across the worker
//! pool. Entries are guarded by a single lock (critical sections are short);
//! hit/miss counters are atomics so statistics never contend with readers.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// A cached analytics payload plus its bookkeeping.
#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    processing_time_ms: Option<i64>,
    hits: u64,
    inserted_at: Instant,
    last_access: Instant,
}

/// What a cache read returns.
#[derive(Debug, Clone, PartialEq)]
pub struct FastCacheHit {
    pub value: serde_json::Value,
    pub processing_time_ms: Option<i64>,
    pub hits: u64,
}

/// Point-in-time statistics for the monitoring endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FastCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub approx_memory_bytes: usize,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

/// Liveness signal for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FastCacheHealth {
    pub healthy: bool,
    pub entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a key; expired entries count as misses and are removed.
    pub fn get(&self, key: &str) -> Option<FastCacheHit> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get_mut(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                entry.hits += 1;
                entry.last_access = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "fast cache hit");
                Some(FastCacheHit {
                    value: entry.value.clone(),
                    processing_time_ms: entry.processing_time_ms,
                    hits: entry.hits,
                })
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key, "fast cache entry expired");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace a key, evicting the least recently used entry when
    /// the store is full.
    pub fn set(&self, key: String, value: serde_json::Value, processing_time_ms: Option<i64>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %oldest, "fast cache LRU eviction");
            }
        }
        let now = Instant::now();
        entries.insert(
            key,
            Entry {
                value,
                processing_time_ms,
                hits: 0,
                inserted_at: now,
                last_access: now,
            },
        );
    }

    /// Remove every key containing `pattern`. Returns the number removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|k, _| !k.contains(pattern));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(pattern, removed, "fast cache invalidation");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FastCacheStats {
        let entries = self.entries.lock().expect("cache lock poisoned");
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let approx_memory_bytes = entries
            .iter()
            .map(|(k, e)| k.len() + e.value.to_string().len())
            .sum();
        FastCacheStats {
            entries: entries.len(),
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            approx_memory_bytes,
            ttl_secs: self.ttl.as_secs(),
            max_entries: self.max_entries,
        }
    }

    pub fn health(&self) -> FastCacheHealth {
        match self.entries.lock() {
            Ok(entries) => FastCacheHealth {
                healthy: true,
                entries: entries.len(),
                error: None,
            },
            Err(e) => FastCacheHealth {
                healthy: false,
                entries: 0,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> MemoryCache {
        MemoryCache::new(Duration::from_secs(3600), 8)
    }

    #[test]
    fn get_miss_then_hit() {
        let c = cache();
        assert!(c.get("k1").is_none());
        c.set("k1".into(), serde_json::json!({"rms": 0.5}), Some(120));
        let hit = c.get("k1").unwrap();
        assert_eq!(hit.value["rms"], 0.5);
        assert_eq!(hit.processing_time_ms, Some(120));
        assert_eq!(hit.hits, 1);

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn ttl_expiry_is_a_miss() {
        let c = MemoryCache::new(Duration::from_millis(0), 8);
        c.set("k1".into(), serde_json::json!(1), None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(c.get("k1").is_none());
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn lru_eviction_removes_oldest() {
        let c = MemoryCache::new(Duration::from_secs(3600), 2);
        c.set("a".into(), serde_json::json!(1), None);
        std::thread::sleep(Duration::from_millis(2));
        c.set("b".into(), serde_json::json!(2), None);
        std::thread::sleep(Duration::from_millis(2));
        // Touch "a" so "b" becomes the LRU victim.
        c.get("a");
        std::thread::sleep(Duration::from_millis(2));
        c.set("c".into(), serde_json::json!(3), None);
        assert!(c.get("a").is_some());
        assert!(c.get("b").is_none());
        assert!(c.get("c").is_some());
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn pattern_invalidation() {
        let c = cache();
        c.set("analysis:abc:v1".into(), serde_json::json!(1), None);
        c.set("analysis:abc:v2".into(), serde_json::json!(2), None);
        c.set("analysis:def:v1".into(), serde_json::json!(3), None);
        assert_eq!(c.invalidate_pattern("abc"), 2);
        assert_eq!(c.len(), 1);
        assert!(c.get("analysis:def:v1").is_some());
    }

    #[test]
    fn health_reports_liveness() {
        let c = cache();
        c.set("k".into(), serde_json::json!(1), None);
        let health = c.health();
        assert!(health.healthy);
        assert_eq!(health.entries, 1);
        assert!(health.error.is_none());
    }

    #[test]
    fn shared_across_threads() {
        let c = std::sync::Arc::new(MemoryCache::new(Duration::from_secs(3600), 1024));
        let mut handles = Vec::new();
        for t in 0..4 {
            let c = c.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("t{t}:{i}");
                    c.set(key.clone(), serde_json::json!(i), None);
                    assert!(c.get(&key).is_some());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let stats = c.stats();
        assert_eq!(stats.hits, 200);
    }
}
