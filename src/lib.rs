//! # EMG C3D Analyzer
//!
//! Stateful ingestion and analysis pipeline for EMG recordings produced by
//! a rehabilitation game. Storage events arrive over a signed webhook; a
//! background worker pool downloads each C3D file, runs a deterministic
//! signal-processing and clinical-scoring pipeline, persists per-session
//! artifacts, and caches results by file fingerprint.
//!
//! ## Features
//!
//! - **Webhook ingestion**: HMAC-SHA256 verified storage events, delivery
//!   deduplication, idempotent session creation
//! - **EMG processing**: Butterworth filtering, rectification, envelope
//!   smoothing, contraction detection with MVC/duration classification
//! - **Spectral fatigue metrics**: RMS, MAV, MPF, MDF, MDF-slope fatigue index
//! - **Clinical scoring**: compliance / symmetry / effort / game components
//!   with decimal-precise weight normalization and temporal adherence
//! - **Dual-layer cache**: in-memory TTL/LRU layer over a durable
//!   `analytics_cache` column, with promotion and singleflight builds
//!
//! ## Architecture
//!
//! - `webhooks` + `server`: event filtering, signatures, HTTP surface
//! - `clinical::session_processor`: the lifecycle state machine
//! - `emg` + `c3d`: pure signal processing and container decoding
//! - `db`: SQLite repositories for the session and its child rows
//! - `cache` + `queue` + `storage`: infrastructure services

pub mod c3d;
pub mod cache;
pub mod clinical;
pub mod config;
pub mod db;
pub mod emg;
pub mod error;
pub mod queue;
pub mod server;
pub mod session_code;
pub mod storage;
pub mod webhooks;

pub use cache::{AnalyticsCache, CachedAnalysis, CacheSource};
pub use clinical::{
    calculate_adherence, AdherenceCategory, AdherenceReport, ChannelAnalytics, FastPathOutcome,
    MuscleMetrics, ProcessorServices, RpeSource, ScoreResult, ScoringEngine, ScoringWeights,
    SessionAnalytics, SessionMetrics, TherapySessionProcessor, WeightManager,
};
pub use config::Settings;
pub use error::{AnalyzerError, Result};
pub use queue::{ProcessingTask, TaskQueue};
pub use server::{create_router, AppState};
pub use storage::ObjectStorage;
pub use webhooks::{EventDeduplicator, StorageEvent, WebhookSecurity};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::c3d::{read_c3d, C3dFile, C3dMetadata};
    pub use crate::cache::AnalyticsCache;
    pub use crate::clinical::{
        ScoringEngine, ScoringWeights, SessionMetrics, TherapySessionProcessor,
    };
    pub use crate::config::Settings;
    pub use crate::emg::{
        analyze_contractions, preprocess_emg_signal, ContractionConfig, SignalConfig,
    };
    pub use crate::error::{AnalyzerError, Result};
    pub use crate::queue::{ProcessingTask, TaskQueue};
    pub use crate::storage::ObjectStorage;
    pub use crate::webhooks::{StorageEvent, WebhookSecurity};
}
