//! Error taxonomy for the ingestion and analysis pipeline
//!
//! Every failure that crosses a module boundary is one of these kinds.
//! Signal-quality and decode failures deliberately carry the readable file
//! facts so the API can explain *why* a recording was rejected.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, AnalyzerError>;

/// Which weight-manager rule was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightErrorKind {
    /// Fewer than the two core components (compliance, symmetry) available.
    InsufficientComponents,
    /// Normalized weights fell outside the 1.0 ± tolerance closure.
    NormalizationFailed,
}

impl std::fmt::Display for WeightErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightErrorKind::InsufficientComponents => write!(f, "INSUFFICIENT_COMPONENTS"),
            WeightErrorKind::NormalizationFailed => write!(f, "NORMALIZATION_FAILED"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// Raw channel failed the quality gate. Carries the measured facts and
    /// the clinical requirements so the rejection can be explained upstream.
    #[error("signal quality: {message} ({samples} samples, {duration_seconds:.3}s at {sampling_rate_hz}Hz, required {min_duration_seconds:.0}-{max_duration_seconds:.0}s)")]
    SignalQuality {
        message: String,
        samples: usize,
        duration_seconds: f64,
        min_duration_seconds: f64,
        max_duration_seconds: f64,
        sampling_rate_hz: f64,
    },

    /// Malformed or truncated C3D container. `metadata` holds whatever
    /// sections were readable before the failure.
    #[error("c3d decode: {message}")]
    C3dDecode {
        message: String,
        metadata: serde_json::Value,
    },

    /// Requested filter cutoff at or above fs/2. Auto-corrected by the
    /// caller; surfaces as a warning, not a pipeline failure.
    #[error("nyquist violation: cutoff {requested_hz}Hz >= fs/2 ({sampling_rate_hz}Hz), corrected to {corrected_hz}Hz")]
    NyquistViolation {
        requested_hz: f64,
        sampling_rate_hz: f64,
        corrected_hz: f64,
    },

    /// Download or filesystem failure while fetching the recording. Retriable.
    #[error("file processing: {0}")]
    FileProcessing(String),

    /// No session row for the given session code.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Generic session-lifecycle failure.
    #[error("therapy session: {0}")]
    TherapySession(String),

    /// Required scoring inputs missing. Non-fatal: the score row is omitted.
    #[error("scoring input: {0}")]
    ScoringInput(String),

    /// Weight normalization rule violated.
    #[error("weight validation [{kind}]: {message}")]
    WeightValidation {
        kind: WeightErrorKind,
        message: String,
    },

    /// Webhook HMAC mismatch. Maps to HTTP 401.
    #[error("signature verification failed: {0}")]
    Signature(String),

    /// A pipeline stage exceeded its time budget.
    #[error("timeout after {seconds}s in {stage}")]
    Timeout { stage: String, seconds: u64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AnalyzerError {
    /// Transient errors that a retry loop is allowed to re-attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, AnalyzerError::FileProcessing(_))
    }

    /// Shorthand for quality-gate rejections.
    pub fn signal_quality(
        message: impl Into<String>,
        samples: usize,
        duration_seconds: f64,
        required: (f64, f64),
        sampling_rate_hz: f64,
    ) -> Self {
        AnalyzerError::SignalQuality {
            message: message.into(),
            samples,
            duration_seconds,
            min_duration_seconds: required.0,
            max_duration_seconds: required.1,
            sampling_rate_hz,
        }
    }
}
