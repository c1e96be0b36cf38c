//! Clinical child-table repositories
//!
//! Per-session artifact rows: technical metadata, processing parameters,
//! per-channel EMG statistics, the performance score, BFR monitoring and
//! session settings, plus the scoring-configuration hierarchy. A session
//! exclusively owns its child rows; deletes cascade from the session.

use crate::clinical::scoring::{default_rpe_mapping, RpeSource, ScoreResult};
use crate::clinical::weights::ScoringWeights;
use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// Technical metadata (1:1, immutable)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TechnicalDataRow {
    pub session_id: String,
    pub sampling_rate_hz: f64,
    pub channel_count: i64,
    /// JSON array of channel labels in file order.
    pub channel_names: String,
    pub frame_count: i64,
    pub duration_seconds: f64,
}

/// First write wins: technical metadata is immutable once recorded.
pub async fn insert_technical_data(
    pool: &SqlitePool,
    session_id: &str,
    sampling_rate_hz: f64,
    channel_names: &[String],
    frame_count: u32,
    duration_seconds: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO c3d_technical_data
            (session_id, sampling_rate_hz, channel_count, channel_names,
             frame_count, duration_seconds, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session_id)
    .bind(sampling_rate_hz)
    .bind(channel_names.len() as i64)
    .bind(serde_json::to_string(channel_names)?)
    .bind(frame_count as i64)
    .bind(duration_seconds)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_technical_data(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Option<TechnicalDataRow>> {
    Ok(sqlx::query_as::<_, TechnicalDataRow>(
        "SELECT session_id, sampling_rate_hz, channel_count, channel_names, frame_count, duration_seconds FROM c3d_technical_data WHERE session_id = ?",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?)
}

// ============================================================================
// Processing parameters (1:1)
// ============================================================================

/// Parameters actually used for a session, after any Nyquist clamping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingParametersRow {
    pub filter_low_cutoff_hz: f64,
    pub filter_high_cutoff_hz: f64,
    pub filter_order: i64,
    pub rms_window_ms: f64,
    pub rectification: bool,
    pub mvc_estimation_method: String,
    pub notch_enabled: bool,
    pub notch_frequency_hz: Option<f64>,
}

pub async fn upsert_processing_parameters(
    pool: &SqlitePool,
    session_id: &str,
    row: &ProcessingParametersRow,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO processing_parameters
            (session_id, filter_low_cutoff_hz, filter_high_cutoff_hz, filter_order,
             rms_window_ms, rectification, mvc_estimation_method,
             notch_enabled, notch_frequency_hz, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session_id)
    .bind(row.filter_low_cutoff_hz)
    .bind(row.filter_high_cutoff_hz)
    .bind(row.filter_order)
    .bind(row.rms_window_ms)
    .bind(row.rectification)
    .bind(&row.mvc_estimation_method)
    .bind(row.notch_enabled)
    .bind(row.notch_frequency_hz)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// EMG statistics (1:N by channel)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmgStatisticsRow {
    pub session_id: String,
    pub channel_name: String,
    pub contraction_count: i64,
    pub good_contraction_count: i64,
    pub mvc_compliant_count: i64,
    pub duration_compliant_count: i64,
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
    /// JSON array of per-contraction records.
    pub contractions: String,
}

pub async fn insert_emg_statistics(
    pool: &SqlitePool,
    row: &EmgStatisticsRow,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO emg_statistics
            (id, session_id, channel_name, contraction_count, good_contraction_count,
             mvc_compliant_count, duration_compliant_count, mean_duration_ms,
             min_duration_ms, max_duration_ms, total_time_under_tension_ms,
             mean_amplitude, max_amplitude, rms, mav, mpf_hz, mdf_hz,
             fatigue_index, contractions, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&row.session_id)
    .bind(&row.channel_name)
    .bind(row.contraction_count)
    .bind(row.good_contraction_count)
    .bind(row.mvc_compliant_count)
    .bind(row.duration_compliant_count)
    .bind(row.mean_duration_ms)
    .bind(row.min_duration_ms)
    .bind(row.max_duration_ms)
    .bind(row.total_time_under_tension_ms)
    .bind(row.mean_amplitude)
    .bind(row.max_amplitude)
    .bind(row.rms)
    .bind(row.mav)
    .bind(row.mpf_hz)
    .bind(row.mdf_hz)
    .bind(row.fatigue_index)
    .bind(&row.contractions)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    debug!(session_id = %row.session_id, channel = %row.channel_name, "emg statistics stored");
    Ok(())
}

pub async fn list_emg_statistics(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Vec<EmgStatisticsRow>> {
    Ok(sqlx::query_as::<_, EmgStatisticsRow>(
        r#"
        SELECT session_id, channel_name, contraction_count, good_contraction_count,
               mvc_compliant_count, duration_compliant_count, mean_duration_ms,
               min_duration_ms, max_duration_ms, total_time_under_tension_ms,
               mean_amplitude, max_amplitude, rms, mav, mpf_hz, mdf_hz,
               fatigue_index, contractions
        FROM emg_statistics WHERE session_id = ? ORDER BY channel_name
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?)
}

// ============================================================================
// Performance score (1:1)
// ============================================================================

pub async fn insert_performance_score(pool: &SqlitePool, score: &ScoreResult) -> Result<()> {
    // The engine clamps too; this is the last line of defense before the
    // table's <= 1.0 check constraints.
    let mut score = score.clone();
    score.clamp_rates();

    let rpe_source = match score.rpe_source {
        RpeSource::Reported => "reported",
        RpeSource::Default => "default",
    };

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO performance_scores
            (session_id, overall_score, compliance_score, symmetry_score, effort_score,
             game_score, left_muscle_compliance, right_muscle_compliance,
             completion_rate_left, completion_rate_right, intensity_rate_left,
             intensity_rate_right, duration_rate_left, duration_rate_right,
             bfr_compliant, rpe_post_session, rpe_source, scoring_config_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(score.session_id.to_string())
    .bind(score.overall_score)
    .bind(score.compliance_score)
    .bind(score.symmetry_score)
    .bind(score.effort_score)
    .bind(score.game_score)
    .bind(score.left_muscle_compliance)
    .bind(score.right_muscle_compliance)
    .bind(score.completion_rate_left)
    .bind(score.completion_rate_right)
    .bind(score.intensity_rate_left)
    .bind(score.intensity_rate_right)
    .bind(score.duration_rate_left)
    .bind(score.duration_rate_right)
    .bind(score.bfr_compliant)
    .bind(score.rpe_post_session as i64)
    .bind(rpe_source)
    .bind(score.scoring_config_id.map(|id| id.to_string()))
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn has_performance_score(pool: &SqlitePool, session_id: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM performance_scores WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

// ============================================================================
// BFR monitoring (1:N by channel)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BfrChannelRow {
    pub session_id: String,
    pub channel_name: String,
    /// Target arterial occlusion percentage for the protocol.
    pub target_pressure_aop: f64,
    pub actual_pressure_aop: Option<f64>,
    pub compliant: bool,
    pub measurement_method: String,
}

pub async fn insert_bfr_monitoring(pool: &SqlitePool, row: &BfrChannelRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO bfr_monitoring
            (id, session_id, channel_name, target_pressure_aop, actual_pressure_aop,
             compliant, measurement_method, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&row.session_id)
    .bind(&row.channel_name)
    .bind(row.target_pressure_aop)
    .bind(row.actual_pressure_aop)
    .bind(row.compliant)
    .bind(&row.measurement_method)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// Session settings (1:1)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionSettingsRow {
    pub session_id: String,
    pub mvc_threshold_percentage: f64,
    pub duration_threshold_ms: f64,
    pub target_contractions_per_muscle: i64,
    pub expected_contractions_per_muscle: i64,
}

pub async fn upsert_session_settings(pool: &SqlitePool, row: &SessionSettingsRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO session_settings
            (session_id, mvc_threshold_percentage, duration_threshold_ms,
             target_contractions_per_muscle, expected_contractions_per_muscle, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.session_id)
    .bind(row.mvc_threshold_percentage)
    .bind(row.duration_threshold_ms)
    .bind(row.target_contractions_per_muscle)
    .bind(row.expected_contractions_per_muscle)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// Rollback
// ============================================================================

/// Delete every child row of a session. Used when the quality gate rejects
/// a file after some rows were written, and before reprocessing.
pub async fn delete_session_children(pool: &SqlitePool, session_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in [
        "c3d_technical_data",
        "processing_parameters",
        "emg_statistics",
        "performance_scores",
        "bfr_monitoring",
        "session_settings",
    ] {
        sqlx::query(&format!("DELETE FROM {table} WHERE session_id = ?"))
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Scoring configuration hierarchy
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScoringConfigurationRow {
    pub id: String,
    pub configuration_name: String,
    pub patient_id: Option<String>,
    pub active: bool,
    pub weight_compliance: f64,
    pub weight_symmetry: f64,
    pub weight_effort: f64,
    pub weight_game: f64,
    pub weight_completion: f64,
    pub weight_intensity: f64,
    pub weight_duration: f64,
    pub rpe_mapping: String,
}

impl ScoringConfigurationRow {
    pub fn weights(&self) -> ScoringWeights {
        ScoringWeights {
            compliance: self.weight_compliance,
            symmetry: self.weight_symmetry,
            effort: self.weight_effort,
            game: self.weight_game,
            completion: self.weight_completion,
            intensity: self.weight_intensity,
            duration: self.weight_duration,
        }
    }
}

/// Make sure the global default configuration exists; returns its id.
pub async fn ensure_default_configuration(pool: &SqlitePool) -> Result<String> {
    if let Some(id) = sqlx::query_scalar::<_, String>(
        "SELECT id FROM scoring_configuration WHERE patient_id IS NULL AND active = 1 LIMIT 1",
    )
    .fetch_optional(pool)
    .await?
    {
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    let w = ScoringWeights::default();
    sqlx::query(
        r#"
        INSERT INTO scoring_configuration
            (id, configuration_name, patient_id, active,
             weight_compliance, weight_symmetry, weight_effort, weight_game,
             weight_completion, weight_intensity, weight_duration,
             rpe_mapping, created_at)
        VALUES (?, 'Default Clinical Configuration', NULL, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(w.compliance)
    .bind(w.symmetry)
    .bind(w.effort)
    .bind(w.game)
    .bind(w.completion)
    .bind(w.intensity)
    .bind(w.duration)
    .bind(default_rpe_mapping().to_string())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(id)
}

async fn get_configuration(
    pool: &SqlitePool,
    id: &str,
) -> Result<Option<ScoringConfigurationRow>> {
    Ok(sqlx::query_as::<_, ScoringConfigurationRow>(
        r#"
        SELECT id, configuration_name, patient_id, active, weight_compliance,
               weight_symmetry, weight_effort, weight_game, weight_completion,
               weight_intensity, weight_duration, rpe_mapping
        FROM scoring_configuration WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

/// Resolve the configuration for a session: per-session pinned, then the
/// patient's current active configuration, then the global default.
pub async fn resolve_scoring_configuration(
    pool: &SqlitePool,
    pinned_config_id: Option<&str>,
    patient_id: Option<&str>,
) -> Result<ScoringConfigurationRow> {
    if let Some(id) = pinned_config_id {
        if let Some(row) = get_configuration(pool, id).await? {
            return Ok(row);
        }
    }

    if let Some(patient) = patient_id {
        if let Some(row) = sqlx::query_as::<_, ScoringConfigurationRow>(
            r#"
            SELECT id, configuration_name, patient_id, active, weight_compliance,
                   weight_symmetry, weight_effort, weight_game, weight_completion,
                   weight_intensity, weight_duration, rpe_mapping
            FROM scoring_configuration
            WHERE patient_id = ? AND active = 1
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(patient)
        .fetch_optional(pool)
        .await?
        {
            return Ok(row);
        }
    }

    let default_id = ensure_default_configuration(pool).await?;
    get_configuration(pool, &default_id).await?.ok_or_else(|| {
        crate::error::AnalyzerError::TherapySession("default scoring configuration missing".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::sessions::create_session;

    #[tokio::test]
    async fn technical_data_is_immutable() {
        let pool = init_test_db().await.unwrap();
        let s = create_session(&pool, "P001", "b", "P001/x.c3d", None, None)
            .await
            .unwrap();
        let names = vec!["CH1".to_string(), "CH2".to_string()];
        insert_technical_data(&pool, &s.id, 990.0, &names, 29700, 30.0)
            .await
            .unwrap();
        // Second write with different values must not take effect.
        insert_technical_data(&pool, &s.id, 2000.0, &names, 1, 0.1)
            .await
            .unwrap();
        let row = get_technical_data(&pool, &s.id).await.unwrap().unwrap();
        assert_eq!(row.sampling_rate_hz, 990.0);
        assert_eq!(row.frame_count, 29700);
        assert_eq!(row.channel_count, 2);
    }

    #[tokio::test]
    async fn emg_statistics_unique_per_channel() {
        let pool = init_test_db().await.unwrap();
        let s = create_session(&pool, "P001", "b", "P001/x.c3d", None, None)
            .await
            .unwrap();
        let mut row = EmgStatisticsRow {
            session_id: s.id.clone(),
            channel_name: "CH1".into(),
            contraction_count: 5,
            good_contraction_count: 3,
            mvc_compliant_count: 4,
            duration_compliant_count: 3,
            mean_duration_ms: 2100.0,
            min_duration_ms: 900.0,
            max_duration_ms: 3500.0,
            total_time_under_tension_ms: 10500.0,
            mean_amplitude: 0.4,
            max_amplitude: 0.9,
            rms: 0.31,
            mav: 0.27,
            mpf_hz: 92.0,
            mdf_hz: 85.0,
            fatigue_index: -0.8,
            contractions: "[]".into(),
        };
        insert_emg_statistics(&pool, &row).await.unwrap();
        row.contraction_count = 7;
        insert_emg_statistics(&pool, &row).await.unwrap();

        let rows = list_emg_statistics(&pool, &s.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].contraction_count, 7);
    }

    #[tokio::test]
    async fn scoring_hierarchy_resolution() {
        let pool = init_test_db().await.unwrap();

        // Global default is created lazily.
        let global = resolve_scoring_configuration(&pool, None, None).await.unwrap();
        assert!(global.patient_id.is_none());
        assert!((global.weight_compliance - 0.40).abs() < 1e-9);

        // A patient-scoped active configuration wins over the default.
        crate::db::patients::create_patient(&pool, "P042", Some("T001"), 30, 14)
            .await
            .unwrap();
        let patient = crate::db::patients::find_by_code(&pool, "P042")
            .await
            .unwrap()
            .unwrap();
        sqlx::query(
            r#"
            INSERT INTO scoring_configuration
                (id, configuration_name, patient_id, active,
                 weight_compliance, weight_symmetry, weight_effort, weight_game,
                 weight_completion, weight_intensity, weight_duration, rpe_mapping, created_at)
            VALUES ('cfg-p42', 'Custom', ?, 1, 0.5, 0.2, 0.2, 0.1, 0.333, 0.333, 0.334, '{}', ?)
            "#,
        )
        .bind(&patient.id)
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        let resolved = resolve_scoring_configuration(&pool, None, Some(&patient.id))
            .await
            .unwrap();
        assert_eq!(resolved.id, "cfg-p42");

        // A pinned id wins over everything.
        let pinned = resolve_scoring_configuration(&pool, Some(&global.id), Some(&patient.id))
            .await
            .unwrap();
        assert_eq!(pinned.id, global.id);
    }

    #[tokio::test]
    async fn delete_children_clears_all_tables() {
        let pool = init_test_db().await.unwrap();
        let s = create_session(&pool, "P001", "b", "P001/x.c3d", None, None)
            .await
            .unwrap();
        insert_technical_data(&pool, &s.id, 1000.0, &["CH1".to_string()], 1000, 1.0)
            .await
            .unwrap();
        upsert_session_settings(
            &pool,
            &SessionSettingsRow {
                session_id: s.id.clone(),
                mvc_threshold_percentage: 75.0,
                duration_threshold_ms: 2000.0,
                target_contractions_per_muscle: 12,
                expected_contractions_per_muscle: 12,
            },
        )
        .await
        .unwrap();

        delete_session_children(&pool, &s.id).await.unwrap();
        assert!(get_technical_data(&pool, &s.id).await.unwrap().is_none());
    }
}
