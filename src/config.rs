//! Service Configuration
//!
//! All tunables are loaded from `EMG_`-prefixed environment variables with
//! clinically justified defaults. `Settings::from_env` never fails: a bad
//! value falls back to the default so a misconfigured deployment degrades
//! rather than refuses to boot (the webhook secret being the one value whose
//! absence changes behavior — see `webhooks::security`).

use std::path::PathBuf;

// ============================================================================
// Signal-processing defaults
// ============================================================================

/// High-pass cutoff removing DC offset and baseline drift.
pub const DEFAULT_HIGHPASS_CUTOFF_HZ: f64 = 20.0;
/// Low-pass cutoff for envelope extraction after rectification.
pub const DEFAULT_LOWPASS_CUTOFF_HZ: f64 = 10.0;
/// Upper edge of the surface-EMG band recorded in processing parameters;
/// clamped to 0.9 * fs/2 when the recording's rate is too low.
pub const DEFAULT_BAND_HIGH_CUTOFF_HZ: f64 = 450.0;
/// Butterworth filter order used for both passes.
pub const DEFAULT_FILTER_ORDER: usize = 4;
/// Moving-average smoothing window, standard for EMG envelopes.
pub const DEFAULT_SMOOTHING_WINDOW_MS: f64 = 50.0;

/// Minimum samples for reliable processing.
pub const MIN_SAMPLES_REQUIRED: usize = 1000;
/// Minimum standard deviation to consider a signal non-flat.
pub const MIN_SIGNAL_VARIATION: f64 = 1e-10;
/// Clinical recording-length bounds in seconds.
pub const MIN_DURATION_SECONDS: f64 = 10.0;
pub const MAX_DURATION_SECONDS: f64 = 600.0;

/// Detection threshold as a fraction of the envelope maximum.
pub const DEFAULT_THRESHOLD_FACTOR: f64 = 0.3;
/// Runs shorter than this are discarded.
pub const DEFAULT_MIN_CONTRACTION_MS: f64 = 50.0;
/// Adjacent runs closer than this are merged.
pub const DEFAULT_MERGE_GAP_MS: f64 = 100.0;
/// MVC amplitude threshold as a percentage of the estimated MVC.
pub const DEFAULT_MVC_THRESHOLD_PERCENT: f64 = 75.0;
/// Therapeutic contraction-duration threshold.
pub const DEFAULT_DURATION_THRESHOLD_MS: f64 = 2000.0;
/// Protocol target per muscle per session.
pub const DEFAULT_EXPECTED_CONTRACTIONS_PER_MUSCLE: u32 = 12;

/// RPE substituted when the patient reported none; maps to full effort.
pub const DEFAULT_RPE: u8 = 4;

/// Bumped whenever pipeline semantics change; part of every cache key.
pub const PROCESSING_VERSION: &str = "2.1.0";

// ============================================================================
// Settings
// ============================================================================

/// Runtime configuration for the whole service.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database path (`sqlite::memory:` supported for tests).
    pub database_url: String,
    /// Base URL of the object-storage HTTP gateway.
    pub storage_base_url: String,
    /// Bucket that C3D uploads are expected to land in.
    pub expected_bucket: String,
    /// HMAC secret for webhook signatures; `None` skips verification (dev).
    pub webhook_secret: Option<String>,
    /// Bind address for the HTTP server.
    pub bind_addr: String,

    // Signal processing
    pub highpass_cutoff_hz: f64,
    pub lowpass_cutoff_hz: f64,
    pub band_high_cutoff_hz: f64,
    pub filter_order: usize,
    pub smoothing_window_ms: f64,

    // Contraction analysis
    pub threshold_factor: f64,
    pub min_contraction_ms: f64,
    pub merge_gap_ms: f64,
    pub mvc_threshold_percent: f64,
    pub duration_threshold_ms: f64,
    pub expected_contractions_per_muscle: u32,
    pub default_rpe: u8,

    // Cache
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,

    // Background processing
    pub queue_depth: usize,
    pub worker_count: usize,
    pub processing_timeout_secs: u64,
    pub download_retries: u32,

    /// Fast-path response budget in milliseconds.
    pub webhook_budget_ms: u64,
    /// Ack-ignore duplicate uploads sharing a fingerprint.
    pub dedup_enabled: bool,
    /// Local spool directory for downloaded recordings.
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:data/emg_analyzer.db".into(),
            storage_base_url: "http://127.0.0.1:54321/storage/v1/object".into(),
            expected_bucket: "c3d-examples".into(),
            webhook_secret: None,
            bind_addr: "127.0.0.1:8080".into(),
            highpass_cutoff_hz: DEFAULT_HIGHPASS_CUTOFF_HZ,
            lowpass_cutoff_hz: DEFAULT_LOWPASS_CUTOFF_HZ,
            band_high_cutoff_hz: DEFAULT_BAND_HIGH_CUTOFF_HZ,
            filter_order: DEFAULT_FILTER_ORDER,
            smoothing_window_ms: DEFAULT_SMOOTHING_WINDOW_MS,
            threshold_factor: DEFAULT_THRESHOLD_FACTOR,
            min_contraction_ms: DEFAULT_MIN_CONTRACTION_MS,
            merge_gap_ms: DEFAULT_MERGE_GAP_MS,
            mvc_threshold_percent: DEFAULT_MVC_THRESHOLD_PERCENT,
            duration_threshold_ms: DEFAULT_DURATION_THRESHOLD_MS,
            expected_contractions_per_muscle: DEFAULT_EXPECTED_CONTRACTIONS_PER_MUSCLE,
            default_rpe: DEFAULT_RPE,
            cache_ttl_secs: 24 * 3600,
            cache_max_entries: 512,
            queue_depth: 64,
            worker_count: num_cpus(),
            processing_timeout_secs: 600,
            download_retries: 3,
            webhook_budget_ms: 1000,
            dedup_enabled: true,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Settings {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let d = Settings::default();
        Self {
            database_url: env_string("EMG_DATABASE_URL", d.database_url),
            storage_base_url: env_string("EMG_STORAGE_BASE_URL", d.storage_base_url),
            expected_bucket: env_string("EMG_EXPECTED_BUCKET", d.expected_bucket),
            webhook_secret: std::env::var("EMG_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            bind_addr: env_string("EMG_BIND_ADDR", d.bind_addr),
            highpass_cutoff_hz: env_parse("EMG_HIGHPASS_CUTOFF_HZ", d.highpass_cutoff_hz),
            lowpass_cutoff_hz: env_parse("EMG_LOWPASS_CUTOFF_HZ", d.lowpass_cutoff_hz),
            band_high_cutoff_hz: env_parse("EMG_BAND_HIGH_CUTOFF_HZ", d.band_high_cutoff_hz),
            filter_order: env_parse("EMG_FILTER_ORDER", d.filter_order),
            smoothing_window_ms: env_parse("EMG_SMOOTHING_WINDOW_MS", d.smoothing_window_ms),
            threshold_factor: env_parse("EMG_THRESHOLD_FACTOR", d.threshold_factor),
            min_contraction_ms: env_parse("EMG_MIN_CONTRACTION_MS", d.min_contraction_ms),
            merge_gap_ms: env_parse("EMG_MERGE_GAP_MS", d.merge_gap_ms),
            mvc_threshold_percent: env_parse("EMG_MVC_THRESHOLD_PERCENT", d.mvc_threshold_percent),
            duration_threshold_ms: env_parse("EMG_DURATION_THRESHOLD_MS", d.duration_threshold_ms),
            expected_contractions_per_muscle: env_parse(
                "EMG_EXPECTED_CONTRACTIONS",
                d.expected_contractions_per_muscle,
            ),
            default_rpe: env_parse("EMG_DEFAULT_RPE", d.default_rpe),
            cache_ttl_secs: env_parse("EMG_CACHE_TTL_SECS", d.cache_ttl_secs),
            cache_max_entries: env_parse("EMG_CACHE_MAX_ENTRIES", d.cache_max_entries),
            queue_depth: env_parse("EMG_QUEUE_DEPTH", d.queue_depth),
            worker_count: env_parse("EMG_WORKER_COUNT", d.worker_count),
            processing_timeout_secs: env_parse(
                "EMG_PROCESSING_TIMEOUT_SECS",
                d.processing_timeout_secs,
            ),
            download_retries: env_parse("EMG_DOWNLOAD_RETRIES", d.download_retries),
            webhook_budget_ms: env_parse("EMG_WEBHOOK_BUDGET_MS", d.webhook_budget_ms),
            dedup_enabled: env_bool("EMG_DEDUP_ENABLED", d.dedup_enabled),
            data_dir: std::env::var("EMG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
        }
    }

    /// Defaults exposed by `GET /config/defaults` for client display.
    pub fn processing_defaults(&self) -> serde_json::Value {
        serde_json::json!({
            "processing_version": PROCESSING_VERSION,
            "filter": {
                "highpass_cutoff_hz": self.highpass_cutoff_hz,
                "lowpass_cutoff_hz": self.lowpass_cutoff_hz,
                "band_high_cutoff_hz": self.band_high_cutoff_hz,
                "order": self.filter_order,
                "smoothing_window_ms": self.smoothing_window_ms,
            },
            "quality": {
                "min_samples": MIN_SAMPLES_REQUIRED,
                "min_signal_variation": MIN_SIGNAL_VARIATION,
                "min_duration_seconds": MIN_DURATION_SECONDS,
                "max_duration_seconds": MAX_DURATION_SECONDS,
            },
            "contraction": {
                "threshold_factor": self.threshold_factor,
                "min_contraction_ms": self.min_contraction_ms,
                "merge_gap_ms": self.merge_gap_ms,
                "mvc_threshold_percent": self.mvc_threshold_percent,
                "duration_threshold_ms": self.duration_threshold_ms,
                "expected_contractions_per_muscle": self.expected_contractions_per_muscle,
            },
            "scoring": {
                "default_rpe": self.default_rpe,
            },
        })
    }
}

// ============================================================================
// Env helpers
// ============================================================================

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
