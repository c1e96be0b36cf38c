//! HTTP server
//!
//! Route bindings for the webhook ingestion endpoint, session status
//! polling, health, cache monitoring and processing defaults. The webhook
//! handler is strictly non-blocking past the session-row insert: heavy work
//! is enqueued for the background worker pool.

use crate::clinical::TherapySessionProcessor;
use crate::db;
use crate::queue::{ProcessingTask, TaskQueue};
use crate::webhooks::{EventDeduplicator, StorageEvent, WebhookSecurity};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<TherapySessionProcessor>,
    pub queue: TaskQueue,
    pub security: Arc<WebhookSecurity>,
    pub dedup: Arc<EventDeduplicator>,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub processing_time_ms: u64,
}

impl WebhookResponse {
    fn accepted(message: impl Into<String>, started: Instant) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            session_code: None,
            session_id: None,
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, Serialize)]
struct SessionStatusResponse {
    session_code: String,
    status: String,
    file_path: String,
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    processed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    has_analysis: bool,
}

// ============================================================================
// Webhook Handler
// ============================================================================

async fn c3d_upload_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let started = Instant::now();

    // Signature first: an unsigned or mis-signed payload is rejected
    // before any parsing.
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.security.verify(&body, signature) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(WebhookResponse {
                success: false,
                message: e.to_string(),
                session_code: None,
                session_id: None,
                processing_time_ms: started.elapsed().as_millis() as u64,
            }),
        )
            .into_response();
    }

    let event: StorageEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse {
                    success: false,
                    message: format!("invalid event payload: {e}"),
                    session_code: None,
                    session_id: None,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                }),
            )
                .into_response();
        }
    };

    let expected_bucket = &state.processor.settings().expected_bucket;
    if !event.is_c3d_upload(expected_bucket) {
        return WebhookResponse::accepted(
            format!(
                "Ignored: not a C3D upload into {expected_bucket} ({}/{})",
                event.record.bucket_id, event.record.name
            ),
            started,
        )
        .into_response();
    }
    if event.patient_code().is_none() {
        return WebhookResponse::accepted(
            format!("Ignored: no patient code in path {}", event.record.name),
            started,
        )
        .into_response();
    }

    // Redelivered events inside the window return the original session
    // without enqueueing a second task. With deduplication disabled every
    // delivery creates a sibling session, linked later by fingerprint.
    let dedup_enabled = state.processor.settings().dedup_enabled;
    if dedup_enabled {
        if let Some(code) = state.dedup.recent(&event) {
            return Json(WebhookResponse {
                success: true,
                message: "Duplicate delivery, session already created".into(),
                session_code: Some(code),
                session_id: None,
                processing_time_ms: started.elapsed().as_millis() as u64,
            })
            .into_response();
        }
    }

    // Fast path under the response budget: create the pending row and
    // enqueue. On overrun the handler still answers 200 with success=false.
    let budget = Duration::from_millis(state.processor.settings().webhook_budget_ms);
    let fast_path = state
        .processor
        .create_session_for_upload(&event.record.bucket_id, &event.record.name);

    match tokio::time::timeout(budget, fast_path).await {
        Ok(Ok(outcome)) => {
            let enqueued = state.queue.try_enqueue(ProcessingTask {
                session_code: outcome.session_code.clone(),
                bucket: event.record.bucket_id.clone(),
                object_path: event.record.name.clone(),
            });
            if dedup_enabled {
                state.dedup.record(&event, &outcome.session_code);
            }

            let message = if enqueued {
                "C3D upload accepted, processing in background".to_string()
            } else {
                // Backpressure: the row stays pending; depth shows in health.
                "C3D upload accepted, queue full, processing deferred".to_string()
            };
            info!(session_code = %outcome.session_code, enqueued, "webhook accepted upload");

            Json(WebhookResponse {
                success: true,
                message,
                session_code: Some(outcome.session_code),
                session_id: Some(outcome.session_id),
                processing_time_ms: started.elapsed().as_millis() as u64,
            })
            .into_response()
        }
        Ok(Err(e)) => {
            warn!("webhook fast path failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WebhookResponse {
                    success: false,
                    message: e.to_string(),
                    session_code: None,
                    session_id: None,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                }),
            )
                .into_response()
        }
        Err(_) => Json(WebhookResponse {
            success: false,
            message: "fast path exceeded response budget".into(),
            session_code: None,
            session_id: None,
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
        .into_response(),
    }
}

// ============================================================================
// Status Handler
// ============================================================================

async fn session_status(
    State(state): State<AppState>,
    Path(session_code): Path<String>,
) -> impl IntoResponse {
    match db::sessions::find_by_code(state.processor.pool(), &session_code).await {
        Ok(session) => Json(SessionStatusResponse {
            session_code: session.session_code,
            status: session.processing_status,
            file_path: format!("{}/{}", session.bucket, session.object_path),
            created_at: session.created_at,
            processed_at: session.processed_at,
            error_message: session.processing_error_message,
            has_analysis: session.analytics_cache.is_some(),
        })
        .into_response(),
        Err(crate::error::AnalyzerError::SessionNotFound(code)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("unknown session: {code}")})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

// ============================================================================
// Adherence
// ============================================================================

#[derive(Debug, Deserialize)]
struct AdherenceQuery {
    /// Protocol day override; defaults to days since treatment start.
    day: Option<u32>,
}

async fn patient_adherence(
    State(state): State<AppState>,
    Path(patient_code): Path<String>,
    Query(query): Query<AdherenceQuery>,
) -> impl IntoResponse {
    let pool = state.processor.pool();
    let patient = match db::patients::find_by_code(pool, &patient_code).await {
        Ok(Some(patient)) => patient,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": format!("unknown patient: {patient_code}")})),
            )
                .into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    // The calculator takes the protocol day as input; the route derives it
    // from the treatment start date only when the caller did not supply one.
    let protocol_day = query.day.unwrap_or_else(|| {
        patient
            .treatment_start_date
            .map(|start| (chrono::Utc::now() - start).num_days().max(1) as u32)
            .unwrap_or(1)
    });

    let completed = match db::sessions::count_completed_for_patient(pool, &patient.id).await {
        Ok(count) => count,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let report = crate::clinical::calculate_adherence(
        patient.total_sessions_planned as u32,
        patient.trial_duration_days as u32,
        protocol_day,
        completed,
    );
    Json(serde_json::json!({
        "patient_code": patient.patient_code,
        "protocol_day": report.protocol_day,
        "trial_duration": report.trial_duration_days,
        "sessions_completed": report.completed_sessions,
        "sessions_expected": report.expected_sessions,
        "adherence_score": report.adherence_score,
        "clinical_threshold": report.category,
        "total_sessions_planned": report.total_sessions_planned,
    }))
    .into_response()
}

// ============================================================================
// Health & Monitoring
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = db::health_check(state.processor.pool()).await;
    let cache = state.processor.cache().fast_health();
    let healthy = database.healthy && cache.healthy;
    Json(serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "service": "emg-c3d-analyzer",
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
        "cache": cache,
        "queue_depth": state.queue.depth(),
        "signature_enforcing": state.security.is_enforcing(),
    }))
}

async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    let fast = state.processor.cache().fast_stats();
    match state.processor.cache().durable_stats().await {
        Ok(durable) => {
            Json(serde_json::json!({"fast": fast, "durable": durable})).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn cache_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.processor.cache().fast_health())
}

async fn invalidate_cache(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> impl IntoResponse {
    match state.processor.cache().invalidate(&fingerprint).await {
        Ok(cleared) => Json(serde_json::json!({"invalidated": cleared})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn config_defaults(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.processor.settings().processing_defaults())
}

// ============================================================================
// Router
// ============================================================================

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Webhooks
        .route("/webhooks/storage/c3d-upload", post(c3d_upload_webhook))
        .route("/webhooks/storage/status/:session_code", get(session_status))
        // Clinical
        .route("/scoring/adherence/:patient_code", get(patient_adherence))
        // Health & monitoring
        .route("/health", get(health_check))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/health", get(cache_health))
        .route("/cache/:fingerprint", delete(invalidate_cache))
        .route("/config/defaults", get(config_defaults))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
