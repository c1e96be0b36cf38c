//! Object storage access
//!
//! The pipeline only needs one operation from storage: download the raw
//! bytes of `(bucket, object_path)`. The HTTP backend talks to the storage
//! gateway with retry and exponential backoff; the in-memory backend backs
//! the test suite. Recordings are immutable, so a successful download never
//! needs revalidation.

use crate::error::{AnalyzerError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// First retry delay; subsequent delays multiply by [`BACKOFF_FACTOR`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const BACKOFF_FACTOR: u32 = 4;

#[derive(Clone)]
pub enum ObjectStorage {
    Http(HttpStorage),
    Memory(MemoryStorage),
}

impl ObjectStorage {
    pub fn http(base_url: &str) -> Self {
        ObjectStorage::Http(HttpStorage {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn in_memory() -> Self {
        ObjectStorage::Memory(MemoryStorage::default())
    }

    /// Download with up to `retries` attempts and exponential backoff
    /// (200ms -> 800ms -> 3.2s). Only retriable failures are retried.
    pub async fn download(&self, bucket: &str, object_path: &str, retries: u32) -> Result<Vec<u8>> {
        let attempts = retries.max(1);
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.download_once(bucket, object_path).await {
                Ok(bytes) => {
                    debug!(bucket, object_path, bytes = bytes.len(), "download complete");
                    return Ok(bytes);
                }
                Err(e) if e.is_retriable() && attempt < attempts => {
                    warn!(bucket, object_path, attempt, "download failed, retrying: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff *= BACKOFF_FACTOR;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AnalyzerError::FileProcessing(format!("download failed for {bucket}/{object_path}"))
        }))
    }

    async fn download_once(&self, bucket: &str, object_path: &str) -> Result<Vec<u8>> {
        match self {
            ObjectStorage::Http(http) => http.download(bucket, object_path).await,
            ObjectStorage::Memory(mem) => mem.download(bucket, object_path),
        }
    }
}

// ============================================================================
// HTTP backend
// ============================================================================

#[derive(Clone)]
pub struct HttpStorage {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStorage {
    async fn download(&self, bucket: &str, object_path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{bucket}/{object_path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AnalyzerError::FileProcessing(format!("GET {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(AnalyzerError::FileProcessing(format!(
                "GET {url}: status {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AnalyzerError::FileProcessing(format!("reading body of {url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

// ============================================================================
// In-memory backend (tests)
// ============================================================================

#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<Mutex<HashMap<(String, String), Vec<u8>>>>,
    /// Failures to inject before a download succeeds, for retry tests.
    failures_remaining: Arc<Mutex<u32>>,
}

impl MemoryStorage {
    pub fn insert(&self, bucket: &str, object_path: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .expect("storage lock poisoned")
            .insert((bucket.to_string(), object_path.to_string()), bytes);
    }

    pub fn fail_next(&self, times: u32) {
        *self.failures_remaining.lock().expect("storage lock poisoned") = times;
    }

    fn download(&self, bucket: &str, object_path: &str) -> Result<Vec<u8>> {
        {
            let mut failures = self.failures_remaining.lock().expect("storage lock poisoned");
            if *failures > 0 {
                *failures -= 1;
                return Err(AnalyzerError::FileProcessing("injected failure".into()));
            }
        }
        self.objects
            .lock()
            .expect("storage lock poisoned")
            .get(&(bucket.to_string(), object_path.to_string()))
            .cloned()
            .ok_or_else(|| {
                AnalyzerError::FileProcessing(format!("object not found: {bucket}/{object_path}"))
            })
    }
}

impl ObjectStorage {
    /// The in-memory backend, when this storage is one. Tests use this to
    /// seed objects and inject failures.
    pub fn as_memory(&self) -> Option<&MemoryStorage> {
        match self {
            ObjectStorage::Memory(mem) => Some(mem),
            ObjectStorage::Http(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_roundtrip() {
        let storage = ObjectStorage::in_memory();
        storage
            .as_memory()
            .unwrap()
            .insert("bucket", "P001/x.c3d", vec![1, 2, 3]);
        let bytes = storage.download("bucket", "P001/x.c3d", 3).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_object_fails_after_retries() {
        let storage = ObjectStorage::in_memory();
        let err = storage.download("bucket", "nope", 2).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        let storage = ObjectStorage::in_memory();
        let mem = storage.as_memory().unwrap();
        mem.insert("bucket", "P001/x.c3d", vec![9]);
        mem.fail_next(2);

        let started = std::time::Instant::now();
        let bytes = storage.download("bucket", "P001/x.c3d", 3).await.unwrap();
        assert_eq!(bytes, vec![9]);
        // Two failures cost 200ms + 800ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }
}
