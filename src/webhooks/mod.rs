//! Storage webhook handling
//!
//! Parses the storage-event envelope, filters it down to C3D uploads into
//! the expected bucket, and deduplicates repeated deliveries of the same
//! object within a short window. Signature verification lives in
//! [`security`]; the HTTP binding lives in `server`.

pub mod security;

use crate::session_code::extract_patient_code;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

pub use security::WebhookSecurity;

/// How long repeated deliveries of one object return the original session.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(300);

// ============================================================================
// Event envelope
// ============================================================================

/// Storage event as delivered by the object-store webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub table: String,
    pub schema: String,
    pub record: ObjectRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object path within the bucket, e.g. `P042/session.c3d`.
    pub name: String,
    pub bucket_id: String,
    #[serde(default)]
    pub metadata: ObjectMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMetadata {
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(rename = "eTag", default)]
    pub etag: Option<String>,
}

impl StorageEvent {
    /// Only INSERTs of `.c3d` objects (case-insensitive) into the expected
    /// bucket are processed; everything else is acked and ignored.
    pub fn is_c3d_upload(&self, expected_bucket: &str) -> bool {
        self.event_type == "INSERT"
            && self.table == "objects"
            && self.schema == "storage"
            && self.record.bucket_id == expected_bucket
            && self
                .record
                .name
                .to_lowercase()
                .ends_with(".c3d")
    }

    /// The `P###` prefix of the object path, when present.
    pub fn patient_code(&self) -> Option<&str> {
        extract_patient_code(&self.record.name)
    }

    /// The quoted hex etag, normalized.
    pub fn etag(&self) -> String {
        self.record
            .metadata
            .etag
            .as_deref()
            .unwrap_or("")
            .trim_matches('"')
            .to_string()
    }
}

// ============================================================================
// Delivery deduplication
// ============================================================================

/// Remembers `(bucket, object_path, etag)` triples for a short window so a
/// redelivered event returns the existing session code instead of
/// enqueueing a second background task.
pub struct EventDeduplicator {
    window: Duration,
    seen: Mutex<HashMap<(String, String, String), (String, Instant)>>,
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

impl EventDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// The session code of a recent identical delivery, if any.
    pub fn recent(&self, event: &StorageEvent) -> Option<String> {
        let key = self.key(event);
        let mut seen = self.seen.lock().expect("dedup lock poisoned");
        seen.retain(|_, (_, at)| at.elapsed() <= self.window);
        seen.get(&key).map(|(code, _)| code.clone())
    }

    /// Remember a processed delivery.
    pub fn record(&self, event: &StorageEvent, session_code: &str) {
        let key = self.key(event);
        debug!(session_code, "recording webhook delivery for deduplication");
        self.seen
            .lock()
            .expect("dedup lock poisoned")
            .insert(key, (session_code.to_string(), Instant::now()));
    }

    fn key(&self, event: &StorageEvent) -> (String, String, String) {
        (
            event.record.bucket_id.clone(),
            event.record.name.clone(),
            event.etag(),
        )
    }
}
