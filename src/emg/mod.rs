//! EMG signal-processing domain
//!
//! Low-level, deterministic signal operations: envelope extraction,
//! contraction detection, and amplitude/spectral metrics. No business
//! context lives here; orchestration belongs to `clinical`.

pub mod contraction;
pub mod filters;
pub mod signal;
pub mod spectral;

pub use contraction::{analyze_contractions, Contraction, ContractionAnalysis, ContractionConfig};
pub use signal::{
    preprocess_emg_signal, validate_signal_quality, ProcessedSignal, SignalConfig, SignalStats,
};
pub use spectral::{compute_spectral_metrics, SpectralMetrics};
