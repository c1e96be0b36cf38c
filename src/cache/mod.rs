//! Content-addressed analytics cache
//!
//! Two layers share one key shape derived from the file fingerprint, the
//! processing version and the canonicalized parameters:
//!
//! - fast: in-process TTL/LRU store (`memory`), consulted first;
//! - durable: the `analytics_cache` column on the session row (single
//!   table), the source of truth.
//!
//! Writes go to both layers; a durable hit is promoted to the fast layer in
//! the background. A version or parameter mismatch is a miss. Invalidation
//! by fingerprint clears both layers. A per-key singleflight barrier lets
//! the session processor guarantee at most one concurrent build per key.
//! Cache failures never fail the pipeline: reads degrade to misses.

pub mod memory;

use crate::config::PROCESSING_VERSION;
use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

pub use memory::{FastCacheHealth, FastCacheStats, MemoryCache};

// ============================================================================
// Keys
// ============================================================================

/// Cache key: the fingerprint stays readable so pattern invalidation by
/// fingerprint works; version and parameters are folded into a digest.
pub fn cache_key(fingerprint: &str, params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(PROCESSING_VERSION.as_bytes());
    hasher.update(canonical_params(params).as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("analysis:{fingerprint}:{}", &digest[..16])
}

/// Canonical JSON text: `serde_json` maps iterate in sorted key order, so
/// serializing is already order-stable.
pub fn canonical_params(params: &serde_json::Value) -> String {
    params.to_string()
}

// ============================================================================
// Payloads
// ============================================================================

/// What the durable layer stores in `analytics_cache`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableCachePayload {
    pub analytics: serde_json::Value,
    pub processing_params: serde_json::Value,
    pub processing_version: String,
    pub cached_at: chrono::DateTime<Utc>,
}

/// Which layer satisfied a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Fast,
    Durable,
}

#[derive(Debug, Clone)]
pub struct CachedAnalysis {
    pub analytics: serde_json::Value,
    pub processing_time_ms: Option<i64>,
    pub cache_hits: i64,
    pub source: CacheSource,
}

// ============================================================================
// Facade
// ============================================================================

/// Per-key singleflight locks; entries are removed by the last departing
/// [`BuildGuard`] so the map stays bounded by in-flight builds.
type BuildLocks = Arc<StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

pub struct AnalyticsCache {
    fast: Arc<MemoryCache>,
    pool: SqlitePool,
    builds: BuildLocks,
}

impl AnalyticsCache {
    pub fn new(pool: SqlitePool, ttl: Duration, max_entries: usize) -> Self {
        Self {
            fast: Arc::new(MemoryCache::new(ttl, max_entries)),
            pool,
            builds: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Look up cached analytics for `(fingerprint, version, params)`.
    pub async fn get(
        &self,
        fingerprint: &str,
        params: &serde_json::Value,
    ) -> Option<CachedAnalysis> {
        let key = cache_key(fingerprint, params);

        if let Some(hit) = self.fast.get(&key) {
            return Some(CachedAnalysis {
                analytics: hit.value,
                processing_time_ms: hit.processing_time_ms,
                cache_hits: hit.hits as i64,
                source: CacheSource::Fast,
            });
        }

        match self.read_durable(fingerprint, params).await {
            Ok(Some(hit)) => {
                // Promote to the fast layer off the read path.
                let fast = self.fast.clone();
                let value = hit.analytics.clone();
                let time = hit.processing_time_ms;
                tokio::spawn(async move {
                    fast.set(key, value, time);
                });
                Some(hit)
            }
            Ok(None) => None,
            Err(e) => {
                // A broken cache must never break processing.
                warn!("durable cache read failed: {e}");
                None
            }
        }
    }

    async fn read_durable(
        &self,
        fingerprint: &str,
        params: &serde_json::Value,
    ) -> Result<Option<CachedAnalysis>> {
        let row: Option<(String, Option<String>, Option<i64>, i64)> = sqlx::query_as(
            r#"
            SELECT id, analytics_cache, processing_time_ms, cache_hits
            FROM therapy_sessions
            WHERE file_hash = ? AND analytics_cache IS NOT NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        let Some((session_id, Some(cache_text), processing_time_ms, cache_hits)) = row else {
            return Ok(None);
        };

        let payload: DurableCachePayload = match serde_json::from_str(&cache_text) {
            Ok(p) => p,
            Err(e) => {
                warn!(session_id, "unreadable analytics_cache payload: {e}");
                return Ok(None);
            }
        };

        if payload.processing_version != PROCESSING_VERSION {
            debug!(
                session_id,
                stored = %payload.processing_version,
                "cache version mismatch"
            );
            return Ok(None);
        }
        if canonical_params(&payload.processing_params) != canonical_params(params) {
            debug!(session_id, "cache parameter mismatch");
            return Ok(None);
        }

        // Best-effort hit bookkeeping on the owning row.
        let _ = sqlx::query(
            "UPDATE therapy_sessions SET cache_hits = cache_hits + 1, last_accessed_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(&session_id)
        .execute(&self.pool)
        .await;

        Ok(Some(CachedAnalysis {
            analytics: payload.analytics,
            processing_time_ms,
            cache_hits: cache_hits + 1,
            source: CacheSource::Durable,
        }))
    }

    /// Dual-write the analytics payload under the session that computed it.
    pub async fn put(
        &self,
        session_id: &str,
        fingerprint: &str,
        params: &serde_json::Value,
        analytics: &serde_json::Value,
        processing_time_ms: Option<i64>,
    ) -> Result<()> {
        let key = cache_key(fingerprint, params);
        self.fast.set(key, analytics.clone(), processing_time_ms);

        let payload = DurableCachePayload {
            analytics: analytics.clone(),
            processing_params: params.clone(),
            processing_version: PROCESSING_VERSION.to_string(),
            cached_at: Utc::now(),
        };
        sqlx::query(
            r#"
            UPDATE therapy_sessions
            SET analytics_cache = ?, processing_time_ms = ?, cache_hits = 0,
                last_accessed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(&payload)?)
        .bind(processing_time_ms)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        debug!(fingerprint = &fingerprint[..16.min(fingerprint.len())], "analytics cached");
        Ok(())
    }

    /// Clear both layers for a fingerprint. Returns affected durable rows.
    pub async fn invalidate(&self, fingerprint: &str) -> Result<u64> {
        self.fast.invalidate_pattern(fingerprint);
        let result = sqlx::query(
            "UPDATE therapy_sessions SET analytics_cache = NULL, cache_hits = 0 WHERE file_hash = ?",
        )
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Per-key build barrier: hold the returned guard around the whole
    /// compute-and-store sequence so concurrent workers for the same key
    /// wait instead of duplicating work. Dropping the guard releases the
    /// key and reclaims the map entry once the last waiter is gone.
    pub async fn build_guard(&self, fingerprint: &str, params: &serde_json::Value) -> BuildGuard {
        let key = cache_key(fingerprint, params);
        let lock = {
            let mut builds = self.builds.lock().expect("builds lock poisoned");
            builds
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let permit = lock.lock_owned().await;
        BuildGuard {
            key,
            builds: self.builds.clone(),
            permit: Some(permit),
        }
    }

    #[cfg(test)]
    fn active_builds(&self) -> usize {
        self.builds.lock().expect("builds lock poisoned").len()
    }

    pub fn fast_stats(&self) -> FastCacheStats {
        self.fast.stats()
    }

    pub fn fast_health(&self) -> FastCacheHealth {
        self.fast.health()
    }

    /// Durable-layer statistics for the monitoring endpoint.
    pub async fn durable_stats(&self) -> Result<serde_json::Value> {
        let (total, cached, hits): (i64, i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(analytics_cache),
                   SUM(CASE WHEN analytics_cache IS NOT NULL THEN cache_hits ELSE 0 END)
            FROM therapy_sessions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(serde_json::json!({
            "total_sessions": total,
            "sessions_with_cache": cached,
            "total_hits": hits.unwrap_or(0),
        }))
    }
}

/// Held for the duration of one cache-key build.
pub struct BuildGuard {
    key: String,
    builds: BuildLocks,
    permit: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        // Release the key lock first; waiters hold their own Arc clones, so
        // a strong count of 1 means the map holds the only reference left
        // and the entry can be reclaimed. A racing new arrival clones from
        // the map before we get here and keeps the entry alive.
        self.permit.take();
        let mut builds = self.builds.lock().expect("builds lock poisoned");
        if let Some(lock) = builds.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                builds.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sessions::create_session;
    use crate::db::{init_test_db, sessions};

    async fn setup() -> (SqlitePool, AnalyticsCache, String) {
        let pool = init_test_db().await.unwrap();
        let session = create_session(&pool, "P001", "b", "P001/x.c3d", None, None)
            .await
            .unwrap();
        sessions::set_fingerprint(&pool, &session.session_code, "fp123")
            .await
            .unwrap();
        let cache = AnalyticsCache::new(pool.clone(), Duration::from_secs(3600), 64);
        (pool, cache, session.id)
    }

    fn params() -> serde_json::Value {
        serde_json::json!({"lowpass_cutoff_hz": 10.0, "filter_order": 4})
    }

    #[test]
    fn key_embeds_fingerprint_and_digest() {
        let key = cache_key("fp123", &params());
        assert!(key.starts_with("analysis:fp123:"));
        // Different params, different key; same params, same key.
        assert_eq!(key, cache_key("fp123", &params()));
        assert_ne!(key, cache_key("fp123", &serde_json::json!({"filter_order": 2})));
    }

    #[test]
    fn canonical_params_ignores_insertion_order() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_params(&a), canonical_params(&b));
    }

    #[tokio::test]
    async fn dual_write_then_fast_hit() {
        let (_pool, cache, session_id) = setup().await;
        let analytics = serde_json::json!({"channels": 2, "overall": 0.8});
        cache
            .put(&session_id, "fp123", &params(), &analytics, Some(850))
            .await
            .unwrap();

        let hit = cache.get("fp123", &params()).await.unwrap();
        assert_eq!(hit.source, CacheSource::Fast);
        assert_eq!(hit.analytics, analytics);
        assert_eq!(hit.processing_time_ms, Some(850));
    }

    #[tokio::test]
    async fn durable_fallback_and_promotion() {
        let (pool, cache, session_id) = setup().await;
        let analytics = serde_json::json!({"overall": 0.7});
        cache
            .put(&session_id, "fp123", &params(), &analytics, Some(500))
            .await
            .unwrap();

        // A fresh cache instance simulates a process restart: the fast
        // layer is empty but the durable column survives.
        let cold = AnalyticsCache::new(pool.clone(), Duration::from_secs(3600), 64);
        let hit = cold.get("fp123", &params()).await.unwrap();
        assert_eq!(hit.source, CacheSource::Durable);
        assert_eq!(hit.analytics, analytics);

        // The promotion task lands shortly after.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let hit = cold.get("fp123", &params()).await.unwrap();
        assert_eq!(hit.source, CacheSource::Fast);
    }

    #[tokio::test]
    async fn parameter_mismatch_is_a_miss() {
        let (_pool, cache, session_id) = setup().await;
        cache
            .put(&session_id, "fp123", &params(), &serde_json::json!({"x": 1}), None)
            .await
            .unwrap();

        let other = serde_json::json!({"lowpass_cutoff_hz": 5.0, "filter_order": 4});
        assert!(cache.get("fp123", &other).await.is_none());
    }

    #[tokio::test]
    async fn invalidation_clears_both_layers() {
        let (pool, cache, session_id) = setup().await;
        cache
            .put(&session_id, "fp123", &params(), &serde_json::json!({"x": 1}), None)
            .await
            .unwrap();
        let cleared = cache.invalidate("fp123").await.unwrap();
        assert_eq!(cleared, 1);
        assert!(cache.get("fp123", &params()).await.is_none());

        let cold = AnalyticsCache::new(pool, Duration::from_secs(3600), 64);
        assert!(cold.get("fp123", &params()).await.is_none());
    }

    #[tokio::test]
    async fn durable_hits_increment_counter() {
        let (pool, cache, session_id) = setup().await;
        cache
            .put(&session_id, "fp123", &params(), &serde_json::json!({"x": 1}), None)
            .await
            .unwrap();

        let cold = AnalyticsCache::new(pool.clone(), Duration::from_secs(3600), 64);
        cold.get("fp123", &params()).await.unwrap();
        let hits: i64 = sqlx::query_scalar("SELECT cache_hits FROM therapy_sessions WHERE id = ?")
            .bind(&session_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn build_guard_serializes_same_key() {
        let (_pool, cache, _session_id) = setup().await;
        let cache = Arc::new(cache);
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let counter = counter.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = cache.build_guard("fp123", &params()).await;
                let now = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(
            peak.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "at most one concurrent build per key"
        );
        assert_eq!(cache.active_builds(), 0, "all build locks reclaimed");
    }

    #[tokio::test]
    async fn build_guard_entries_do_not_accumulate() {
        let (_pool, cache, _session_id) = setup().await;
        // One distinct key per upload must not leave a lock behind.
        for i in 0..32 {
            let fingerprint = format!("fp-{i}");
            let guard = cache.build_guard(&fingerprint, &params()).await;
            assert_eq!(cache.active_builds(), 1);
            drop(guard);
        }
        assert_eq!(cache.active_builds(), 0);

        // An entry stays alive exactly while someone holds or awaits it.
        let guard = cache.build_guard("fp-held", &params()).await;
        assert_eq!(cache.active_builds(), 1);
        drop(guard);
        assert_eq!(cache.active_builds(), 0);
    }
}
