//! End-to-end pipeline tests
//!
//! Drive the webhook surface and the background pipeline against an
//! in-memory database and object store, with synthetic C3D recordings.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use emg_c3d_analyzer::c3d::test_support::C3dFixture;
use emg_c3d_analyzer::cache::AnalyticsCache;
use emg_c3d_analyzer::clinical::{ProcessorServices, TherapySessionProcessor};
use emg_c3d_analyzer::config::Settings;
use emg_c3d_analyzer::db;
use emg_c3d_analyzer::queue::{spawn_workers, ProcessingTask, TaskQueue};
use emg_c3d_analyzer::server::{create_router, AppState};
use emg_c3d_analyzer::storage::ObjectStorage;
use emg_c3d_analyzer::webhooks::{security, EventDeduplicator, WebhookSecurity};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    state: AppState,
    processor: Arc<TherapySessionProcessor>,
    storage: ObjectStorage,
}

async fn harness(secret: Option<&str>) -> Harness {
    harness_with(secret, true).await
}

async fn harness_with(secret: Option<&str>, dedup_enabled: bool) -> Harness {
    let pool = db::init_test_db().await.unwrap();
    let settings = Settings {
        database_url: "sqlite::memory:".into(),
        webhook_secret: secret.map(String::from),
        dedup_enabled,
        ..Settings::default()
    };
    let storage = ObjectStorage::in_memory();
    let cache = Arc::new(AnalyticsCache::new(
        pool.clone(),
        Duration::from_secs(3600),
        64,
    ));
    let processor = Arc::new(TherapySessionProcessor::new(ProcessorServices {
        pool,
        storage: storage.clone(),
        cache,
        settings: settings.clone(),
    }));
    let (queue, _rx) = TaskQueue::new(settings.queue_depth);
    let state = AppState {
        processor: processor.clone(),
        queue,
        security: Arc::new(WebhookSecurity::new(settings.webhook_secret.clone())),
        dedup: Arc::new(EventDeduplicator::default()),
    };
    Harness {
        state,
        processor,
        storage,
    }
}

fn upload_event(name: &str, bucket: &str) -> String {
    serde_json::json!({
        "type": "INSERT",
        "table": "objects",
        "schema": "storage",
        "record": {
            "name": name,
            "bucket_id": bucket,
            "metadata": {"size": 1024, "eTag": "\"feedc0de\""}
        }
    })
    .to_string()
}

async fn post_webhook(
    harness: &Harness,
    body: String,
    signature: Option<String>,
) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri("/webhooks/storage/c3d-upload")
        .header("content-type", "application/json");
    if let Some(sig) = signature {
        request = request.header("x-signature", sig);
    }
    let response = create_router(harness.state.clone())
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn get_status(harness: &Harness, session_code: &str) -> (StatusCode, serde_json::Value) {
    let response = create_router(harness.state.clone())
        .oneshot(
            Request::builder()
                .uri(format!("/webhooks/storage/status/{session_code}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// 60s two-channel recording at 1kHz: an 80Hz carrier that is quiet except
/// for one 2.5s supra-threshold plateau starting at t=10s.
fn burst_recording() -> Vec<u8> {
    let fs = 1000.0;
    let channel: Vec<f64> = (0..60_000)
        .map(|i| {
            let t = i as f64 / fs;
            let amplitude = if (10.0..12.5).contains(&t) { 1.0 } else { 0.01 };
            amplitude * (2.0 * PI * 80.0 * t).sin()
        })
        .collect();
    C3dFixture::new(fs, 2)
        .with_game_name("Ghostly")
        .with_level("3")
        .with_samples(vec![channel.clone(), channel])
        .build()
}

// ============================================================================
// Webhook surface
// ============================================================================

#[tokio::test]
async fn upload_event_creates_pending_session() {
    let h = harness(None).await;
    let (status, json) = post_webhook(&h, upload_event("P042/x.c3d", "c3d-examples"), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    let code = json["session_code"].as_str().unwrap();
    assert!(
        regex::Regex::new(r"^P042S\d{3}$").unwrap().is_match(code),
        "unexpected session code {code}"
    );
    assert!(json["session_id"].as_str().is_some());

    let (status, body) = get_status(&h, code).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["has_analysis"], false);
}

#[tokio::test]
async fn non_c3d_uploads_are_ignored() {
    let h = harness(None).await;
    let (status, json) = post_webhook(&h, upload_event("document.pdf", "documents"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert!(json["message"].as_str().unwrap().contains("Ignored"));
    assert!(json.get("session_code").is_none());

    // No session row was created.
    let health = db::health_check(h.processor.pool()).await;
    assert_eq!(health.session_count, 0);
}

#[tokio::test]
async fn invalid_json_is_a_bad_request() {
    let h = harness(None).await;
    let (status, _) = post_webhook(&h, "{not json".into(), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn wrong_signature_is_unauthorized() {
    let h = harness(Some("real-secret")).await;
    let body = upload_event("P042/x.c3d", "c3d-examples");
    let bad = security::generate_signature(body.as_bytes(), "other-secret").unwrap();
    let (status, _) = post_webhook(&h, body, Some(bad)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn correct_signature_is_accepted() {
    let h = harness(Some("real-secret")).await;
    let body = upload_event("P042/x.c3d", "c3d-examples");
    let sig = security::generate_signature(body.as_bytes(), "real-secret").unwrap();
    let (status, json) = post_webhook(&h, body, Some(sig)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
}

#[tokio::test]
async fn duplicate_delivery_returns_same_session_code() {
    let h = harness(None).await;
    let body = upload_event("P042/x.c3d", "c3d-examples");
    let (_, first) = post_webhook(&h, body.clone(), None).await;
    let (_, second) = post_webhook(&h, body, None).await;
    assert_eq!(first["session_code"], second["session_code"]);
    assert!(second["message"].as_str().unwrap().contains("Duplicate"));

    let health = db::health_check(h.processor.pool()).await;
    assert_eq!(health.session_count, 1);
}

#[tokio::test]
async fn dedup_disabled_creates_sibling_sessions() {
    let h = harness_with(None, false).await;
    let body = upload_event("P042/x.c3d", "c3d-examples");
    let (_, first) = post_webhook(&h, body.clone(), None).await;
    let (_, second) = post_webhook(&h, body, None).await;

    // Same upload, two distinct session rows.
    assert_ne!(first["session_code"], second["session_code"]);
    let health = db::health_check(h.processor.pool()).await;
    assert_eq!(health.session_count, 2);
}

#[tokio::test]
async fn unknown_session_status_is_not_found() {
    let h = harness(None).await;
    let (status, _) = get_status(&h, "P999S999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Background pipeline
// ============================================================================

async fn create_and_process(
    h: &Harness,
    object_path: &str,
    bytes: Vec<u8>,
) -> emg_c3d_analyzer::Result<String> {
    h.storage
        .as_memory()
        .unwrap()
        .insert("c3d-examples", object_path, bytes);
    let outcome = h
        .processor
        .create_session_for_upload("c3d-examples", object_path)
        .await?;
    h.processor
        .process_task(&ProcessingTask {
            session_code: outcome.session_code.clone(),
            bucket: "c3d-examples".into(),
            object_path: object_path.into(),
        })
        .await?;
    Ok(outcome.session_code)
}

#[tokio::test]
async fn burst_recording_full_analysis() {
    let h = harness(None).await;
    let code = create_and_process(&h, "P042/burst.c3d", burst_recording())
        .await
        .unwrap();

    let pool = h.processor.pool();
    let session = db::sessions::find_by_code(pool, &code).await.unwrap();
    assert_eq!(session.processing_status, "completed");
    assert!(session.processed_at.is_some());
    assert!(session.file_hash.is_some());

    // Per-channel statistics: one plateau per channel, long enough for the
    // 2000ms duration threshold.
    let stats = db::clinical::list_emg_statistics(pool, &session.id)
        .await
        .unwrap();
    assert_eq!(stats.len(), 2);
    for row in &stats {
        assert!(row.contraction_count >= 1, "channel {}", row.channel_name);
        assert!(
            row.duration_compliant_count >= 1,
            "expected a >=2s contraction on {}",
            row.channel_name
        );
        assert!(row.rms > 0.0);
        assert!(row.mpf_hz > 0.0);
    }

    // Score row present with every rate in range.
    let scores: (f64, f64, f64, f64, f64, f64) = sqlx::query_as(
        r#"
        SELECT completion_rate_left, completion_rate_right, intensity_rate_left,
               intensity_rate_right, duration_rate_left, duration_rate_right
        FROM performance_scores WHERE session_id = ?
        "#,
    )
    .bind(&session.id)
    .fetch_one(pool)
    .await
    .unwrap();
    for rate in [scores.0, scores.1, scores.2, scores.3, scores.4, scores.5] {
        assert!((0.0..=1.0).contains(&rate), "rate {rate} outside [0,1]");
    }

    // Technical metadata and processing parameters landed, with the high
    // cutoff clamped below Nyquist.
    let technical = db::clinical::get_technical_data(pool, &session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(technical.sampling_rate_hz, 1000.0);
    assert_eq!(technical.channel_count, 2);
    let (low, high): (f64, f64) = sqlx::query_as(
        "SELECT filter_low_cutoff_hz, filter_high_cutoff_hz FROM processing_parameters WHERE session_id = ?",
    )
    .bind(&session.id)
    .fetch_one(pool)
    .await
    .unwrap();
    assert!(low > 0.0);
    assert!(low < high);
    assert!(high < 500.0, "high cutoff {high} must stay below fs/2");

    // Status endpoint reflects the analysis.
    let (_, body) = get_status(&h, &code).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["has_analysis"], true);
}

#[tokio::test]
async fn too_short_recording_fails_quality_gate_with_context() {
    let h = harness(None).await;
    // The real-world rejection shape: 990Hz but only 30 samples.
    let bytes = C3dFixture::new(990.0, 1)
        .with_game_name("Ghostly")
        .with_samples(vec![(0..30).map(|i| (i as f64 * 0.7).sin()).collect()])
        .build();

    let err = create_and_process(&h, "P042/short.c3d", bytes)
        .await
        .unwrap_err();
    let text = err.to_string();
    assert!(text.contains("signal quality"), "got: {text}");

    let session = db::sessions::find_by_code(h.processor.pool(), "P042S001")
        .await
        .unwrap();
    assert_eq!(session.processing_status, "failed");

    // The stored error message carries the measured facts and the readable
    // C3D metadata so the rejection can be explained.
    let message = session.processing_error_message.unwrap();
    assert!(message.contains("30 samples"), "got: {message}");
    assert!(message.contains("10-600s"), "got: {message}");
    assert!(message.contains("990"), "got: {message}");
    assert!(message.contains("Ghostly"), "got: {message}");

    // No partial child rows survive a quality rejection.
    let stats = db::clinical::list_emg_statistics(h.processor.pool(), &session.id)
        .await
        .unwrap();
    assert!(stats.is_empty());
    assert!(db::clinical::get_technical_data(h.processor.pool(), &session.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn identical_bytes_hit_the_cache_second_time() {
    let h = harness(None).await;
    let bytes = burst_recording();

    let first = create_and_process(&h, "P042/first.c3d", bytes.clone())
        .await
        .unwrap();
    let second = create_and_process(&h, "P042/second.c3d", bytes)
        .await
        .unwrap();
    assert_ne!(first, second);

    let pool = h.processor.pool();
    let s1 = db::sessions::find_by_code(pool, &first).await.unwrap();
    let s2 = db::sessions::find_by_code(pool, &second).await.unwrap();

    // Identical bytes share the fingerprint, and the second processing was
    // a cache hit: no statistics rows were recomputed for it.
    assert_eq!(s1.file_hash, s2.file_hash);
    assert_eq!(s2.processing_status, "completed");
    let stats = db::clinical::list_emg_statistics(pool, &s2.id).await.unwrap();
    assert!(stats.is_empty(), "cache hit must not recompute statistics");

    // Both sessions still carry scores and cached analytics.
    assert!(db::clinical::has_performance_score(pool, &s1.id).await.unwrap());
    assert!(db::clinical::has_performance_score(pool, &s2.id).await.unwrap());
    assert!(s2.analytics_cache.is_some());

    // Warm fast layer answers quickly: the second run spent well under the
    // cache-hit budget.
    assert!(s2.processing_time_ms.unwrap() < 1000);
    let cache_stats = h.processor.cache().fast_stats();
    assert!(cache_stats.hits >= 1);
}

#[tokio::test]
async fn worker_pool_processes_webhook_uploads() {
    let h = harness(None).await;
    h.storage
        .as_memory()
        .unwrap()
        .insert("c3d-examples", "P007/run.c3d", burst_recording());

    // Real worker pool wired to the webhook queue.
    let (queue, rx) = TaskQueue::new(8);
    let state = AppState {
        queue: queue.clone(),
        ..h.state.clone()
    };
    let _workers = spawn_workers(
        &queue,
        rx,
        2,
        Duration::from_secs(60),
        h.processor.clone(),
    );

    let wired = Harness {
        state,
        processor: h.processor.clone(),
        storage: h.storage.clone(),
    };
    let (status, json) =
        post_webhook(&wired, upload_event("P007/run.c3d", "c3d-examples"), None).await;
    assert_eq!(status, StatusCode::OK);
    let code = json["session_code"].as_str().unwrap().to_string();

    // Poll until the background worker completes the session.
    for _ in 0..100 {
        let (_, body) = get_status(&wired, &code).await;
        if body["status"] == "completed" {
            assert_eq!(body["has_analysis"], true);
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session {code} did not complete in time");
}

#[tokio::test]
async fn adherence_endpoint_reports_temporal_baseline() {
    let h = harness(None).await;
    let pool = h.processor.pool();
    db::patients::create_patient(pool, "P042", Some("T007"), 30, 14)
        .await
        .unwrap();

    // One completed session by protocol day 7 (expected ~15): poor.
    create_and_process(&h, "P042/burst.c3d", burst_recording())
        .await
        .unwrap();

    let response = create_router(h.state.clone())
        .oneshot(
            Request::builder()
                .uri("/scoring/adherence/P042?day=7")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["protocol_day"], 7);
    assert_eq!(body["sessions_completed"], 1);
    assert!((body["sessions_expected"].as_f64().unwrap() - 15.0).abs() < 1e-6);
    assert_eq!(body["clinical_threshold"], "poor");

    // Unknown patients are a 404.
    let response = create_router(h.state.clone())
        .oneshot(
            Request::builder()
                .uri("/scoring/adherence/P999?day=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reprocessing_a_completed_session_rebuilds_child_rows() {
    let h = harness(None).await;
    let code = create_and_process(&h, "P042/burst.c3d", burst_recording())
        .await
        .unwrap();

    // Same bytes, same parameters, warm cache: the realistic reprocessing
    // case. The run must still rebuild the child rows it deletes, not be
    // answered by its own cached analytics.
    h.processor
        .process_task(&ProcessingTask {
            session_code: code.clone(),
            bucket: "c3d-examples".into(),
            object_path: "P042/burst.c3d".into(),
        })
        .await
        .unwrap();

    let pool = h.processor.pool();
    let session = db::sessions::find_by_code(pool, &code).await.unwrap();
    assert_eq!(session.processing_status, "completed");

    // Completed implies all child rows present.
    let stats = db::clinical::list_emg_statistics(pool, &session.id).await.unwrap();
    assert_eq!(stats.len(), 2);
    assert!(db::clinical::get_technical_data(pool, &session.id)
        .await
        .unwrap()
        .is_some());
    assert!(db::clinical::has_performance_score(pool, &session.id)
        .await
        .unwrap());
    assert!(session.analytics_cache.is_some());
}

#[tokio::test]
async fn download_failure_marks_session_failed() {
    let h = harness(None).await;
    // No object seeded: the download fails after retries.
    let outcome = h
        .processor
        .create_session_for_upload("c3d-examples", "P042/missing.c3d")
        .await
        .unwrap();
    let err = h
        .processor
        .process_task(&ProcessingTask {
            session_code: outcome.session_code.clone(),
            bucket: "c3d-examples".into(),
            object_path: "P042/missing.c3d".into(),
        })
        .await
        .unwrap_err();
    assert!(err.is_retriable());

    let session = db::sessions::find_by_code(h.processor.pool(), &outcome.session_code)
        .await
        .unwrap();
    assert_eq!(session.processing_status, "failed");
    assert!(session.processing_error_message.is_some());
}

#[tokio::test]
async fn corrupted_file_fails_with_decode_error() {
    let h = harness(None).await;
    let err = create_and_process(&h, "P042/garbage.c3d", vec![0u8; 64])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        emg_c3d_analyzer::AnalyzerError::C3dDecode { .. }
    ));

    let session = db::sessions::find_by_code(h.processor.pool(), "P042S001")
        .await
        .unwrap();
    assert_eq!(session.processing_status, "failed");
}
