//! Database module
//!
//! Pool initialization, schema creation and repositories for the session
//! lifecycle and its clinical child tables. SQLite is the authoritative
//! store; every mutation of a session's child rows happens from that
//! session's background task.

pub mod clinical;
pub mod patients;
pub mod sessions;

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

pub use clinical::{
    BfrChannelRow, EmgStatisticsRow, ScoringConfigurationRow, SessionSettingsRow, TechnicalDataRow,
};
pub use patients::Patient;
pub use sessions::{ProcessingStatus, TherapySession};

// ============================================================================
// Pool
// ============================================================================

/// Connect and make sure the schema exists.
pub async fn init_db(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(crate::error::AnalyzerError::Database)?
        .create_if_missing(true);

    // An in-memory database lives and dies with its single connection:
    // more connections would each see their own empty database, and idle
    // reaping would silently drop the data.
    let mut pool_options = SqlitePoolOptions::new().max_connections(5);
    if database_url.contains(":memory:") {
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = pool_options.connect_with(options).await?;

    create_tables(&pool).await?;
    info!("database initialized at {database_url}");
    Ok(pool)
}

/// In-memory database for tests.
pub async fn init_test_db() -> Result<SqlitePool> {
    init_db("sqlite::memory:").await
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseHealth {
    pub healthy: bool,
    pub session_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn health_check(pool: &SqlitePool) -> DatabaseHealth {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM therapy_sessions")
        .fetch_one(pool)
        .await
    {
        Ok(count) => DatabaseHealth {
            healthy: true,
            session_count: count,
            error: None,
        },
        Err(e) => DatabaseHealth {
            healthy: false,
            session_count: 0,
            error: Some(e.to_string()),
        },
    }
}

// ============================================================================
// Schema
// ============================================================================

pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS patients (
            id TEXT PRIMARY KEY,
            patient_code TEXT NOT NULL UNIQUE,
            therapist_id TEXT,
            treatment_start_date TEXT,
            total_sessions_planned INTEGER NOT NULL DEFAULT 30,
            trial_duration_days INTEGER NOT NULL DEFAULT 14,
            created_at TEXT NOT NULL
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS therapy_sessions (
            id TEXT PRIMARY KEY,
            session_code TEXT NOT NULL UNIQUE,
            file_hash TEXT,
            bucket TEXT NOT NULL,
            object_path TEXT NOT NULL,
            patient_id TEXT,
            therapist_id TEXT,
            processing_status TEXT NOT NULL DEFAULT 'pending',
            processing_error_message TEXT,
            processing_time_ms INTEGER,
            analytics_cache TEXT,
            cache_hits INTEGER NOT NULL DEFAULT 0,
            last_accessed_at TEXT,
            scoring_config_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            processed_at TEXT,
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS c3d_technical_data (
            session_id TEXT PRIMARY KEY,
            sampling_rate_hz REAL NOT NULL,
            channel_count INTEGER NOT NULL,
            channel_names TEXT NOT NULL,
            frame_count INTEGER NOT NULL,
            duration_seconds REAL NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES therapy_sessions(id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_parameters (
            session_id TEXT PRIMARY KEY,
            filter_low_cutoff_hz REAL NOT NULL,
            filter_high_cutoff_hz REAL NOT NULL,
            filter_order INTEGER NOT NULL,
            rms_window_ms REAL NOT NULL,
            rectification INTEGER NOT NULL DEFAULT 1,
            mvc_estimation_method TEXT NOT NULL,
            notch_enabled INTEGER NOT NULL DEFAULT 0,
            notch_frequency_hz REAL,
            created_at TEXT NOT NULL,
            CHECK (filter_low_cutoff_hz > 0),
            CHECK (filter_high_cutoff_hz > filter_low_cutoff_hz),
            FOREIGN KEY (session_id) REFERENCES therapy_sessions(id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS emg_statistics (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            channel_name TEXT NOT NULL,
            contraction_count INTEGER NOT NULL,
            good_contraction_count INTEGER NOT NULL,
            mvc_compliant_count INTEGER NOT NULL,
            duration_compliant_count INTEGER NOT NULL,
            mean_duration_ms REAL NOT NULL,
            min_duration_ms REAL NOT NULL,
            max_duration_ms REAL NOT NULL,
            total_time_under_tension_ms REAL NOT NULL,
            mean_amplitude REAL NOT NULL,
            max_amplitude REAL NOT NULL,
            rms REAL NOT NULL,
            mav REAL NOT NULL,
            mpf_hz REAL NOT NULL,
            mdf_hz REAL NOT NULL,
            fatigue_index REAL NOT NULL,
            contractions TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(session_id, channel_name),
            FOREIGN KEY (session_id) REFERENCES therapy_sessions(id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS performance_scores (
            session_id TEXT PRIMARY KEY,
            overall_score REAL NOT NULL,
            compliance_score REAL NOT NULL,
            symmetry_score REAL NOT NULL,
            effort_score REAL NOT NULL,
            game_score REAL,
            left_muscle_compliance REAL NOT NULL,
            right_muscle_compliance REAL NOT NULL,
            completion_rate_left REAL NOT NULL CHECK (completion_rate_left <= 1.0),
            completion_rate_right REAL NOT NULL CHECK (completion_rate_right <= 1.0),
            intensity_rate_left REAL NOT NULL CHECK (intensity_rate_left <= 1.0),
            intensity_rate_right REAL NOT NULL CHECK (intensity_rate_right <= 1.0),
            duration_rate_left REAL NOT NULL CHECK (duration_rate_left <= 1.0),
            duration_rate_right REAL NOT NULL CHECK (duration_rate_right <= 1.0),
            bfr_compliant INTEGER NOT NULL DEFAULT 0,
            rpe_post_session INTEGER NOT NULL,
            rpe_source TEXT NOT NULL DEFAULT 'reported',
            scoring_config_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES therapy_sessions(id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bfr_monitoring (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            channel_name TEXT NOT NULL,
            target_pressure_aop REAL NOT NULL,
            actual_pressure_aop REAL,
            compliant INTEGER NOT NULL DEFAULT 0,
            measurement_method TEXT NOT NULL DEFAULT 'estimated',
            created_at TEXT NOT NULL,
            UNIQUE(session_id, channel_name),
            FOREIGN KEY (session_id) REFERENCES therapy_sessions(id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_settings (
            session_id TEXT PRIMARY KEY,
            mvc_threshold_percentage REAL NOT NULL,
            duration_threshold_ms REAL NOT NULL,
            target_contractions_per_muscle INTEGER NOT NULL,
            expected_contractions_per_muscle INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES therapy_sessions(id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scoring_configuration (
            id TEXT PRIMARY KEY,
            configuration_name TEXT NOT NULL,
            patient_id TEXT,
            active INTEGER NOT NULL DEFAULT 0,
            weight_compliance REAL NOT NULL,
            weight_symmetry REAL NOT NULL,
            weight_effort REAL NOT NULL,
            weight_game REAL NOT NULL,
            weight_completion REAL NOT NULL,
            weight_intensity REAL NOT NULL,
            weight_duration REAL NOT NULL,
            rpe_mapping TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        )
    "#,
    )
    .execute(pool)
    .await?;

    // Lookup indexes for the webhook fast path and cache reads.
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_code ON therapy_sessions(session_code)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_hash ON therapy_sessions(file_hash)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sessions_status ON therapy_sessions(processing_status)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_patient ON therapy_sessions(patient_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_emg_stats_session ON emg_statistics(session_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scoring_active ON scoring_configuration(active, patient_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
