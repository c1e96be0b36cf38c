//! Therapy session processor
//!
//! Orchestrates the ingestion pipeline around the session state machine:
//!
//! - fast path (inside the webhook response budget): resolve the patient
//!   from the upload path, create a `pending` session row, enqueue;
//! - background path: download, fingerprint, cache consult, decode, per
//!   channel envelope + contraction analysis, persistence of every child
//!   row, scoring from the in-memory analytics, cache write, completion.
//!
//! Collaborating services are injected as a bundle; the processor holds no
//! back-references and owns no global state.

use crate::c3d::{read_c3d, C3dFile, C3dMetadata};
use crate::cache::AnalyticsCache;
use crate::clinical::scoring::{MuscleMetrics, ScoringEngine, SessionMetrics};
use crate::config::Settings;
use crate::db::clinical::{
    self, BfrChannelRow, EmgStatisticsRow, ProcessingParametersRow, SessionSettingsRow,
};
use crate::db::sessions::{self, ProcessingStatus, TherapySession};
use crate::db::patients;
use crate::emg::{
    analyze_contractions, compute_spectral_metrics, preprocess_emg_signal, Contraction,
    ContractionConfig, SignalConfig,
};
use crate::error::{AnalyzerError, Result};
use crate::queue::ProcessingTask;
use crate::session_code::extract_patient_code;
use crate::storage::ObjectStorage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Default target arterial occlusion for BFR rows.
const BFR_TARGET_AOP: f64 = 50.0;

// ============================================================================
// Analytics payload
// ============================================================================

/// Per-channel analysis results, both persisted as `emg_statistics` rows
/// and cached as part of the analytics payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAnalytics {
    pub channel_name: String,
    pub contraction_count: u32,
    pub good_contraction_count: u32,
    pub mvc_compliant_count: u32,
    pub duration_compliant_count: u32,
    pub mean_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub total_time_under_tension_ms: f64,
    pub mean_amplitude: f64,
    pub max_amplitude: f64,
    pub rms: f64,
    pub mav: f64,
    pub mpf_hz: f64,
    pub mdf_hz: f64,
    pub fatigue_index: f64,
    pub contractions: Vec<Contraction>,
}

/// The cacheable analysis result for one recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAnalytics {
    pub channels: Vec<ChannelAnalytics>,
    pub metadata: C3dMetadata,
}

/// What the webhook fast path returns to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct FastPathOutcome {
    pub session_code: String,
    pub session_id: String,
}

// ============================================================================
// Processor
// ============================================================================

/// Injected collaborator bundle.
pub struct ProcessorServices {
    pub pool: SqlitePool,
    pub storage: ObjectStorage,
    pub cache: Arc<AnalyticsCache>,
    pub settings: Settings,
}

pub struct TherapySessionProcessor {
    pool: SqlitePool,
    storage: ObjectStorage,
    cache: Arc<AnalyticsCache>,
    settings: Settings,
}

impl TherapySessionProcessor {
    pub fn new(services: ProcessorServices) -> Self {
        Self {
            pool: services.pool,
            storage: services.storage,
            cache: services.cache,
            settings: services.settings,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn cache(&self) -> &AnalyticsCache {
        &self.cache
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The canonical parameter signature folded into every cache key.
    pub fn parameter_signature(&self) -> serde_json::Value {
        serde_json::json!({
            "highpass_cutoff_hz": self.settings.highpass_cutoff_hz,
            "lowpass_cutoff_hz": self.settings.lowpass_cutoff_hz,
            "band_high_cutoff_hz": self.settings.band_high_cutoff_hz,
            "filter_order": self.settings.filter_order,
            "smoothing_window_ms": self.settings.smoothing_window_ms,
            "threshold_factor": self.settings.threshold_factor,
            "min_contraction_ms": self.settings.min_contraction_ms,
            "merge_gap_ms": self.settings.merge_gap_ms,
            "mvc_threshold_percent": self.settings.mvc_threshold_percent,
            "duration_threshold_ms": self.settings.duration_threshold_ms,
        })
    }

    // ------------------------------------------------------------------
    // Fast path
    // ------------------------------------------------------------------

    /// Create the `pending` session row for an accepted upload. Must stay
    /// within the webhook response budget: one lookup and one insert.
    pub async fn create_session_for_upload(
        &self,
        bucket: &str,
        object_path: &str,
    ) -> Result<FastPathOutcome> {
        let patient_code = extract_patient_code(object_path).ok_or_else(|| {
            AnalyzerError::TherapySession(format!(
                "object path {object_path} has no patient code prefix"
            ))
        })?;

        // Patient and therapist resolution is optional: unknown patients
        // still get a session row for later linking.
        let patient = patients::find_by_code(&self.pool, patient_code).await?;
        let (patient_id, therapist_id) = match &patient {
            Some(p) => (Some(p.id.as_str()), p.therapist_id.as_deref()),
            None => (None, None),
        };

        let session = sessions::create_session(
            &self.pool,
            patient_code,
            bucket,
            object_path,
            patient_id,
            therapist_id,
        )
        .await?;

        Ok(FastPathOutcome {
            session_code: session.session_code,
            session_id: session.id,
        })
    }

    // ------------------------------------------------------------------
    // Background path
    // ------------------------------------------------------------------

    /// Run the full pipeline for one task, driving the status machine.
    pub async fn process_task(&self, task: &ProcessingTask) -> Result<()> {
        let session = sessions::find_by_code(&self.pool, &task.session_code).await?;
        let reprocessing = match session.status() {
            ProcessingStatus::Pending => {
                sessions::update_status(
                    &self.pool,
                    &task.session_code,
                    ProcessingStatus::Processing,
                    None,
                )
                .await?;
                false
            }
            ProcessingStatus::Completed => {
                sessions::update_status(
                    &self.pool,
                    &task.session_code,
                    ProcessingStatus::Reprocessing,
                    None,
                )
                .await?;
                clinical::delete_session_children(&self.pool, &session.id).await?;
                true
            }
            ProcessingStatus::Processing => false,
            // A resumed reprocessing run has already dropped its child rows.
            ProcessingStatus::Reprocessing => true,
            ProcessingStatus::Failed => {
                return Err(AnalyzerError::TherapySession(format!(
                    "session {} already failed",
                    task.session_code
                )));
            }
        };

        let started = Instant::now();
        match self.run_pipeline(&session, task, reprocessing).await {
            Ok(()) => {
                sessions::set_processing_time(
                    &self.pool,
                    &task.session_code,
                    started.elapsed().as_millis() as i64,
                )
                .await?;
                sessions::update_status(
                    &self.pool,
                    &task.session_code,
                    ProcessingStatus::Completed,
                    None,
                )
                .await?;
                Ok(())
            }
            Err(err) => {
                let message = failure_message(&err);
                let _ = sessions::update_status(
                    &self.pool,
                    &task.session_code,
                    ProcessingStatus::Failed,
                    Some(&message),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Called by a worker whose task ran past the per-file budget.
    pub async fn mark_timeout(&self, task: &ProcessingTask, seconds: u64) {
        let err = AnalyzerError::Timeout {
            stage: "background processing".into(),
            seconds,
        };
        let _ = sessions::update_status(
            &self.pool,
            &task.session_code,
            ProcessingStatus::Failed,
            Some(&err.to_string()),
        )
        .await;
    }

    async fn run_pipeline(
        &self,
        session: &TherapySession,
        task: &ProcessingTask,
        force_recompute: bool,
    ) -> Result<()> {
        // Step 2: fetch the immutable recording.
        let bytes = self
            .storage
            .download(&task.bucket, &task.object_path, self.settings.download_retries)
            .await?;

        // Step 3: fingerprint and cache consult, under the per-key
        // singleflight barrier for the rest of the build.
        let fingerprint = hex_sha256(&bytes);
        sessions::set_fingerprint(&self.pool, &task.session_code, &fingerprint).await?;
        let params = self.parameter_signature();
        let _build = self.cache.build_guard(&fingerprint, &params).await;

        // A reprocessing run has just dropped its child rows and must
        // rebuild them; its own durable cache entry would otherwise answer
        // here and leave a completed session with no child rows. The
        // shortcut is only for fresh sessions of already-analyzed bytes.
        if !force_recompute {
            if let Some(hit) = self.cache.get(&fingerprint, &params).await {
                if let Ok(analytics) =
                    serde_json::from_value::<SessionAnalytics>(hit.analytics.clone())
                {
                    info!(session_code = %task.session_code, source = ?hit.source, "cache hit, skipping signal pipeline");
                    self.score_and_cache(session, &fingerprint, &params, &analytics)
                        .await?;
                    return Ok(());
                }
                warn!(session_code = %task.session_code, "cached analytics unreadable, recomputing");
            }
        }

        // Step 4: decode and check the recording against Nyquist.
        let file = read_c3d(&bytes)?;
        let sampling_rate = file.metadata.sampling_rate.ok_or_else(|| {
            AnalyzerError::C3dDecode {
                message: "ANALOG:RATE missing".into(),
                metadata: file.metadata.to_json(),
            }
        })?;
        let safe_high_cutoff = self.safe_high_cutoff(sampling_rate);

        // Step 5: per-channel signal pipeline and contraction analysis.
        let analytics = self.analyze_channels(&file, sampling_rate)?;

        // Step 6: persist the child rows.
        self.persist_child_rows(session, &file.metadata, &analytics, safe_high_cutoff)
            .await?;

        // Steps 7-10: score from the in-memory analytics (the freshly
        // written rows may not be visible to a read yet), cache, done.
        self.score_and_cache(session, &fingerprint, &params, &analytics)
            .await?;
        Ok(())
    }

    /// Clamp the EMG band's upper edge to 0.9 * fs/2; a violation is
    /// corrected and logged, never fatal.
    fn safe_high_cutoff(&self, sampling_rate: f64) -> f64 {
        let configured = self.settings.band_high_cutoff_hz;
        let nyquist = sampling_rate / 2.0;
        if configured >= nyquist {
            let corrected = 0.9 * nyquist;
            let err = AnalyzerError::NyquistViolation {
                requested_hz: configured,
                sampling_rate_hz: sampling_rate,
                corrected_hz: corrected,
            };
            warn!("{err}");
            corrected
        } else {
            configured.min(0.9 * nyquist)
        }
    }

    fn analyze_channels(&self, file: &C3dFile, sampling_rate: f64) -> Result<SessionAnalytics> {
        let signal_config = SignalConfig {
            highpass_cutoff_hz: self.settings.highpass_cutoff_hz,
            lowpass_cutoff_hz: self.settings.lowpass_cutoff_hz,
            filter_order: self.settings.filter_order,
            smoothing_window_ms: self.settings.smoothing_window_ms,
            enable_filtering: true,
            enable_rectification: true,
            enable_smoothing: true,
        };

        let mut channels = Vec::with_capacity(file.channels.len());
        for channel in &file.channels {
            let processed = preprocess_emg_signal(&channel.samples, sampling_rate, &signal_config);
            let envelope = match processed.signal {
                Some(env) => env,
                None => {
                    // A quality rejection carries the full file context so
                    // the UI can explain why the recording was refused.
                    let err = processed.error.unwrap_or_else(|| {
                        AnalyzerError::TherapySession("signal rejected without detail".into())
                    });
                    return Err(quality_failure(err, &file.metadata));
                }
            };

            let mvc_estimate = percentile(&envelope, 0.95);
            let contraction_config = ContractionConfig {
                threshold_factor: self.settings.threshold_factor,
                min_duration_ms: self.settings.min_contraction_ms,
                merge_gap_ms: self.settings.merge_gap_ms,
                mvc_amplitude_threshold: (mvc_estimate > 0.0)
                    .then(|| self.settings.mvc_threshold_percent / 100.0 * mvc_estimate),
                duration_threshold_ms: Some(self.settings.duration_threshold_ms),
            };
            let analysis = analyze_contractions(&envelope, sampling_rate, &contraction_config);
            let spectral = compute_spectral_metrics(&channel.samples, sampling_rate);

            channels.push(ChannelAnalytics {
                channel_name: channel.name.clone(),
                contraction_count: analysis.contraction_count as u32,
                good_contraction_count: analysis.good_contraction_count as u32,
                mvc_compliant_count: analysis.mvc_compliant_count as u32,
                duration_compliant_count: analysis.duration_compliant_count as u32,
                mean_duration_ms: analysis.mean_duration_ms(),
                min_duration_ms: analysis.min_duration_ms(),
                max_duration_ms: analysis.max_duration_ms(),
                total_time_under_tension_ms: analysis.total_time_under_tension_ms(),
                mean_amplitude: analysis.mean_amplitude(),
                max_amplitude: analysis.max_amplitude(),
                rms: spectral.rms,
                mav: spectral.mav,
                mpf_hz: spectral.mpf_hz,
                mdf_hz: spectral.mdf_hz,
                fatigue_index: spectral.fatigue_index,
                contractions: analysis.contractions,
            });
        }

        Ok(SessionAnalytics {
            channels,
            metadata: file.metadata.clone(),
        })
    }

    async fn persist_child_rows(
        &self,
        session: &TherapySession,
        metadata: &C3dMetadata,
        analytics: &SessionAnalytics,
        safe_high_cutoff: f64,
    ) -> Result<()> {
        let sampling_rate = metadata.sampling_rate.unwrap_or(0.0);
        let channel_names: Vec<String> = analytics
            .channels
            .iter()
            .map(|c| c.channel_name.clone())
            .collect();

        clinical::insert_technical_data(
            &self.pool,
            &session.id,
            sampling_rate,
            &channel_names,
            metadata.frame_count.unwrap_or(0),
            metadata.duration_seconds.unwrap_or(0.0),
        )
        .await?;

        clinical::upsert_processing_parameters(
            &self.pool,
            &session.id,
            &ProcessingParametersRow {
                filter_low_cutoff_hz: self.settings.highpass_cutoff_hz,
                filter_high_cutoff_hz: safe_high_cutoff,
                filter_order: self.settings.filter_order as i64,
                rms_window_ms: self.settings.smoothing_window_ms,
                rectification: true,
                mvc_estimation_method: "backend_statistical".into(),
                notch_enabled: false,
                notch_frequency_hz: None,
            },
        )
        .await?;

        for channel in &analytics.channels {
            clinical::insert_emg_statistics(
                &self.pool,
                &EmgStatisticsRow {
                    session_id: session.id.clone(),
                    channel_name: channel.channel_name.clone(),
                    contraction_count: channel.contraction_count as i64,
                    good_contraction_count: channel.good_contraction_count as i64,
                    mvc_compliant_count: channel.mvc_compliant_count as i64,
                    duration_compliant_count: channel.duration_compliant_count as i64,
                    mean_duration_ms: channel.mean_duration_ms,
                    min_duration_ms: channel.min_duration_ms,
                    max_duration_ms: channel.max_duration_ms,
                    total_time_under_tension_ms: channel.total_time_under_tension_ms,
                    mean_amplitude: channel.mean_amplitude,
                    max_amplitude: channel.max_amplitude,
                    rms: channel.rms,
                    mav: channel.mav,
                    mpf_hz: channel.mpf_hz,
                    mdf_hz: channel.mdf_hz,
                    fatigue_index: channel.fatigue_index,
                    contractions: serde_json::to_string(&channel.contractions)?,
                },
            )
            .await?;

            clinical::insert_bfr_monitoring(
                &self.pool,
                &BfrChannelRow {
                    session_id: session.id.clone(),
                    channel_name: channel.channel_name.clone(),
                    target_pressure_aop: BFR_TARGET_AOP,
                    actual_pressure_aop: None,
                    compliant: true,
                    measurement_method: "estimated".into(),
                },
            )
            .await?;
        }

        clinical::upsert_session_settings(
            &self.pool,
            &SessionSettingsRow {
                session_id: session.id.clone(),
                mvc_threshold_percentage: self.settings.mvc_threshold_percent,
                duration_threshold_ms: self.settings.duration_threshold_ms,
                target_contractions_per_muscle: self.settings.expected_contractions_per_muscle
                    as i64,
                expected_contractions_per_muscle: self.settings.expected_contractions_per_muscle
                    as i64,
            },
        )
        .await?;

        Ok(())
    }

    /// Steps 7-10: score from in-memory analytics, persist the clamped
    /// score row, write both cache layers.
    async fn score_and_cache(
        &self,
        session: &TherapySession,
        fingerprint: &str,
        params: &serde_json::Value,
        analytics: &SessionAnalytics,
    ) -> Result<()> {
        match self.compute_score(session, analytics).await {
            Ok(score) => clinical::insert_performance_score(&self.pool, &score).await?,
            // Missing inputs or a broken configuration leave the score row
            // absent; the session still completes.
            Err(e @ (AnalyzerError::ScoringInput(_) | AnalyzerError::WeightValidation { .. })) => {
                warn!(session_code = %session.session_code, "score omitted: {e}");
            }
            Err(e) => return Err(e),
        }

        let payload = serde_json::to_value(analytics)?;
        if let Err(e) = self
            .cache
            .put(&session.id, fingerprint, params, &payload, None)
            .await
        {
            // Cache failures never fail the pipeline.
            warn!(session_code = %session.session_code, "cache write failed: {e}");
        }
        Ok(())
    }

    async fn compute_score(
        &self,
        session: &TherapySession,
        analytics: &SessionAnalytics,
    ) -> Result<crate::clinical::scoring::ScoreResult> {
        let config = clinical::resolve_scoring_configuration(
            &self.pool,
            session.scoring_config_id.as_deref(),
            session.patient_id.as_deref(),
        )
        .await?;
        // Pin the resolved configuration so a later reprocessing scores
        // the session with the same weights.
        if session.scoring_config_id.is_none() {
            sessions::pin_scoring_config(&self.pool, &session.session_code, &config.id).await?;
        }

        let mut engine = ScoringEngine::new(config.weights(), self.settings.default_rpe)?;
        if let Ok(config_id) = Uuid::parse_str(&config.id) {
            engine = engine.with_config_id(config_id);
        }

        let metrics = session_metrics(session, analytics, &self.settings)?;
        engine.compute(&metrics)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Interpolation-free percentile on a sorted copy.
fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// First channel is the left muscle, second the right; a single-channel
/// recording scores with a silent right side.
fn session_metrics(
    session: &TherapySession,
    analytics: &SessionAnalytics,
    settings: &Settings,
) -> Result<SessionMetrics> {
    let side = |channel: Option<&ChannelAnalytics>| match channel {
        Some(c) => MuscleMetrics {
            total_contractions: c.contraction_count,
            mvc_compliant: c.mvc_compliant_count,
            duration_compliant: c.duration_compliant_count,
        },
        None => MuscleMetrics::default(),
    };

    if analytics.channels.is_empty() {
        return Err(AnalyzerError::ScoringInput(
            "no analyzed channels to score".into(),
        ));
    }

    Ok(SessionMetrics {
        session_id: Uuid::parse_str(&session.id)
            .map_err(|e| AnalyzerError::ScoringInput(format!("bad session id: {e}")))?,
        left: side(analytics.channels.first()),
        right: side(analytics.channels.get(1)),
        expected_contractions_per_muscle: settings.expected_contractions_per_muscle,
        bfr_compliant: true,
        rpe_post_session: None,
        game_points_achieved: analytics.metadata.game_score.map(|s| s as u32),
        game_points_max: None,
    })
}

/// Attach the readable file metadata to a quality rejection so the status
/// endpoint can explain what was wrong with the recording.
fn quality_failure(err: AnalyzerError, metadata: &C3dMetadata) -> AnalyzerError {
    match err {
        e @ AnalyzerError::SignalQuality { .. } => {
            let payload = serde_json::json!({
                "error": e.to_string(),
                "metadata": metadata.to_json(),
            });
            AnalyzerError::TherapySession(payload.to_string())
        }
        other => other,
    }
}

/// Structured `processing_error_message` content for a failed session.
fn failure_message(err: &AnalyzerError) -> String {
    match err {
        AnalyzerError::C3dDecode { message, metadata } => serde_json::json!({
            "error": format!("c3d decode: {message}"),
            "metadata": metadata,
        })
        .to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_bounds() {
        let values: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&values, 0.95), 95.0);
        assert_eq!(percentile(&values, 0.0), 0.0);
        assert_eq!(percentile(&values, 1.0), 100.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn fingerprint_is_stable_sha256() {
        let a = hex_sha256(b"identical bytes");
        let b = hex_sha256(b"identical bytes");
        let c = hex_sha256(b"different bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn quality_failure_embeds_metadata() {
        let err = AnalyzerError::signal_quality("too short", 30, 0.03, (10.0, 600.0), 990.0);
        let md = C3dMetadata {
            sampling_rate: Some(990.0),
            frame_count: Some(30),
            ..Default::default()
        };
        let wrapped = quality_failure(err, &md);
        let text = wrapped.to_string();
        let payload: serde_json::Value =
            serde_json::from_str(text.trim_start_matches("therapy session: ")).unwrap();
        assert!(payload["error"].as_str().unwrap().contains("signal quality"));
        assert_eq!(payload["metadata"]["sampling_rate"], 990.0);
        assert_eq!(payload["metadata"]["frame_count"], 30);
    }
}
