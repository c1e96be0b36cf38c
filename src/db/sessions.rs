//! Therapy session repository
//!
//! Row creation for the webhook fast path, fingerprint lookups for
//! deduplication, and the status state machine. Transitions are persisted
//! before the corresponding work begins; within one session code they are
//! serialized by the owning background task.

use crate::error::{AnalyzerError, Result};
use crate::session_code;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

// ============================================================================
// Status state machine
// ============================================================================

/// Lifecycle of a session. Monotonic except `Completed -> Reprocessing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Reprocessing,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Reprocessing => "reprocessing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            "reprocessing" => Some(ProcessingStatus::Reprocessing),
            _ => None,
        }
    }

    /// Legal forward transitions. `Failed` is terminal; the only backward
    /// edge is `Completed -> Reprocessing`.
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Reprocessing)
                | (Reprocessing, Completed)
                | (Reprocessing, Failed)
        )
    }
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TherapySession {
    pub id: String,

    /// Human-readable `P###S###` identifier.
    pub session_code: String,

    /// SHA-256 of the raw recording; set once the download completes.
    pub file_hash: Option<String>,

    pub bucket: String,
    pub object_path: String,

    pub patient_id: Option<String>,
    pub therapist_id: Option<String>,

    pub processing_status: String,
    pub processing_error_message: Option<String>,
    pub processing_time_ms: Option<i64>,

    /// Durable cache layer: JSON blob of the analytics payload.
    pub analytics_cache: Option<String>,
    pub cache_hits: i64,
    pub last_accessed_at: Option<DateTime<Utc>>,

    pub scoring_config_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl TherapySession {
    pub fn status(&self) -> ProcessingStatus {
        ProcessingStatus::parse(&self.processing_status).unwrap_or(ProcessingStatus::Pending)
    }
}

// ============================================================================
// Creation (webhook fast path)
// ============================================================================

/// Create a `pending` session row with a fresh `P###S###` code.
///
/// The ordinal is the next free slot for the patient; a concurrent insert
/// racing for the same ordinal loses on the unique index and retries.
pub async fn create_session(
    pool: &SqlitePool,
    patient_code: &str,
    bucket: &str,
    object_path: &str,
    patient_id: Option<&str>,
    therapist_id: Option<&str>,
) -> Result<TherapySession> {
    for attempt in 0..10 {
        let like = format!("{patient_code}S%");
        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM therapy_sessions WHERE session_code LIKE ?")
                .bind(&like)
                .fetch_one(pool)
                .await?;
        let code = session_code::generate(patient_code, existing as u32 + 1 + attempt);

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO therapy_sessions
                (id, session_code, bucket, object_path, patient_id, therapist_id,
                 processing_status, cache_hits, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&code)
        .bind(bucket)
        .bind(object_path)
        .bind(patient_id)
        .bind(therapist_id)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await;

        match inserted {
            Ok(_) => {
                info!(session_code = %code, "created therapy session");
                return find_by_code(pool, &code).await;
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                warn!(session_code = %code, "session code taken, retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(AnalyzerError::TherapySession(format!(
        "could not allocate a session code for {patient_code}"
    )))
}

// ============================================================================
// Lookups
// ============================================================================

pub async fn find_by_code(pool: &SqlitePool, code: &str) -> Result<TherapySession> {
    sqlx::query_as::<_, TherapySession>("SELECT * FROM therapy_sessions WHERE session_code = ?")
        .bind(code)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AnalyzerError::SessionNotFound(code.to_string()))
}

/// Most recent completed session carrying this fingerprint, if any.
pub async fn find_completed_by_fingerprint(
    pool: &SqlitePool,
    file_hash: &str,
) -> Result<Option<TherapySession>> {
    Ok(sqlx::query_as::<_, TherapySession>(
        r#"
        SELECT * FROM therapy_sessions
        WHERE file_hash = ? AND processing_status = 'completed'
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(file_hash)
    .fetch_optional(pool)
    .await?)
}

/// Sessions the patient has completed, for the adherence baseline.
pub async fn count_completed_for_patient(pool: &SqlitePool, patient_id: &str) -> Result<u32> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM therapy_sessions WHERE patient_id = ? AND processing_status = 'completed'",
    )
    .bind(patient_id)
    .fetch_one(pool)
    .await?;
    Ok(count as u32)
}

// ============================================================================
// Mutations (background task only)
// ============================================================================

/// Persist a status transition, enforcing the state machine.
pub async fn update_status(
    pool: &SqlitePool,
    session_code: &str,
    next: ProcessingStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let session = find_by_code(pool, session_code).await?;
    let current = session.status();
    if !current.can_transition_to(next) {
        return Err(AnalyzerError::TherapySession(format!(
            "illegal status transition {} -> {} for {session_code}",
            current.as_str(),
            next.as_str()
        )));
    }

    let processed_at = matches!(next, ProcessingStatus::Completed).then(Utc::now);
    sqlx::query(
        r#"
        UPDATE therapy_sessions
        SET processing_status = ?, processing_error_message = ?, updated_at = ?,
            processed_at = COALESCE(?, processed_at)
        WHERE session_code = ?
        "#,
    )
    .bind(next.as_str())
    .bind(error_message)
    .bind(Utc::now())
    .bind(processed_at)
    .bind(session_code)
    .execute(pool)
    .await?;

    info!(session_code, from = current.as_str(), to = next.as_str(), "status transition");
    Ok(())
}

pub async fn set_fingerprint(pool: &SqlitePool, session_code: &str, file_hash: &str) -> Result<()> {
    sqlx::query("UPDATE therapy_sessions SET file_hash = ?, updated_at = ? WHERE session_code = ?")
        .bind(file_hash)
        .bind(Utc::now())
        .bind(session_code)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_processing_time(
    pool: &SqlitePool,
    session_code: &str,
    processing_time_ms: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE therapy_sessions SET processing_time_ms = ?, updated_at = ? WHERE session_code = ?",
    )
    .bind(processing_time_ms)
    .bind(Utc::now())
    .bind(session_code)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn pin_scoring_config(
    pool: &SqlitePool,
    session_code: &str,
    scoring_config_id: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE therapy_sessions SET scoring_config_id = ?, updated_at = ? WHERE session_code = ?",
    )
    .bind(scoring_config_id)
    .bind(Utc::now())
    .bind(session_code)
    .execute(pool)
    .await?;
    Ok(())
}
