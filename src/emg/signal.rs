//! EMG signal preprocessing pipeline
//!
//! Controlled, documented processing chain producing an RMS envelope:
//!
//! Raw -> [High-pass 20Hz] -> [Rectify] -> [Low-pass 10Hz] -> [Smooth 50ms]
//!
//! Every run records the steps actually applied and the parameter values
//! actually used, so a stored result is reproducible. The pipeline is a fold
//! over an ordered list of stage functions; a failing stage is recorded and
//! processing continues with the signal it received, while a failing quality
//! gate aborts with a structured error.

use crate::config::{
    MAX_DURATION_SECONDS, MIN_DURATION_SECONDS, MIN_SAMPLES_REQUIRED, MIN_SIGNAL_VARIATION,
};
use crate::emg::filters::{self, Band};
use crate::error::AnalyzerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Parameters controlling the preprocessing chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub highpass_cutoff_hz: f64,
    pub lowpass_cutoff_hz: f64,
    pub filter_order: usize,
    pub smoothing_window_ms: f64,
    pub enable_filtering: bool,
    pub enable_rectification: bool,
    pub enable_smoothing: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            highpass_cutoff_hz: crate::config::DEFAULT_HIGHPASS_CUTOFF_HZ,
            lowpass_cutoff_hz: crate::config::DEFAULT_LOWPASS_CUTOFF_HZ,
            filter_order: crate::config::DEFAULT_FILTER_ORDER,
            smoothing_window_ms: crate::config::DEFAULT_SMOOTHING_WINDOW_MS,
            enable_filtering: true,
            enable_rectification: true,
            enable_smoothing: true,
        }
    }
}

// ============================================================================
// Result types
// ============================================================================

/// Descriptive statistics recorded before and after processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SignalStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub samples: usize,
}

impl SignalStats {
    pub fn of(signal: &[f64]) -> Self {
        let n = signal.len().max(1) as f64;
        let mean = signal.iter().sum::<f64>() / n;
        let var = signal.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: var.sqrt(),
            min: signal.iter().cloned().fold(f64::INFINITY, f64::min),
            max: signal.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            samples: signal.len(),
        }
    }
}

/// Outcome of the full preprocessing chain.
#[derive(Debug)]
pub struct ProcessedSignal {
    /// The RMS envelope; `None` when the quality gate rejected the input.
    pub signal: Option<Vec<f64>>,
    /// Ordered descriptors of the steps actually applied.
    pub steps: Vec<String>,
    /// Parameter values actually used, for reproducibility.
    pub parameters_used: BTreeMap<String, serde_json::Value>,
    pub original_stats: Option<SignalStats>,
    pub processed_stats: Option<SignalStats>,
    /// Nyquist clamps and skipped stages.
    pub warnings: Vec<String>,
    /// Populated only on quality-gate rejection.
    pub error: Option<AnalyzerError>,
}

impl ProcessedSignal {
    pub fn is_valid(&self) -> bool {
        self.signal.is_some()
    }
}

// ============================================================================
// Quality gate
// ============================================================================

/// Validate a raw channel before any processing.
///
/// Checks, in order: sample count, flat-line variation, non-finite values,
/// clinical duration bounds. The returned error always carries the measured
/// facts and the required range.
pub fn validate_signal_quality(signal: &[f64], sampling_rate: f64) -> Result<(), AnalyzerError> {
    let duration = if sampling_rate > 0.0 {
        signal.len() as f64 / sampling_rate
    } else {
        0.0
    };
    let reject = |message: String| {
        AnalyzerError::signal_quality(
            message,
            signal.len(),
            duration,
            (MIN_DURATION_SECONDS, MAX_DURATION_SECONDS),
            sampling_rate,
        )
    };

    if signal.len() < MIN_SAMPLES_REQUIRED {
        return Err(reject(format!(
            "signal too short: {} samples < {} required",
            signal.len(),
            MIN_SAMPLES_REQUIRED
        )));
    }

    let stats = SignalStats::of(signal);
    if stats.std < MIN_SIGNAL_VARIATION {
        return Err(reject(format!(
            "signal lacks variation: std={:.2e} < {:.2e}",
            stats.std, MIN_SIGNAL_VARIATION
        )));
    }

    if signal.iter().any(|v| !v.is_finite()) {
        return Err(reject("signal contains NaN or infinite values".into()));
    }

    if duration < MIN_DURATION_SECONDS || duration > MAX_DURATION_SECONDS {
        return Err(reject(format!(
            "duration {duration:.2}s outside clinical range [{MIN_DURATION_SECONDS}, {MAX_DURATION_SECONDS}]s"
        )));
    }

    Ok(())
}

// ============================================================================
// Pipeline stages
// ============================================================================

/// What a single stage did to the signal.
struct StageOutcome {
    signal: Vec<f64>,
    descriptor: Option<String>,
    params: Vec<(&'static str, serde_json::Value)>,
    warning: Option<String>,
}

type Stage = fn(Vec<f64>, f64, &SignalConfig) -> StageOutcome;

fn highpass_stage(signal: Vec<f64>, fs: f64, config: &SignalConfig) -> StageOutcome {
    if !config.enable_filtering {
        return StageOutcome { signal, descriptor: None, params: vec![], warning: None };
    }
    let wn = config.highpass_cutoff_hz / (fs / 2.0);
    if wn >= 1.0 {
        return StageOutcome {
            signal,
            descriptor: None,
            params: vec![],
            warning: Some(format!(
                "high-pass cutoff {}Hz too high for fs {}Hz, stage skipped",
                config.highpass_cutoff_hz, fs
            )),
        };
    }
    match filters::butter(config.filter_order, wn, Band::Highpass) {
        Some(coeffs) => {
            let filtered = filters::filtfilt(&coeffs, &signal);
            StageOutcome {
                signal: filtered,
                descriptor: Some(format!(
                    "High-pass filter: {}Hz, order {}",
                    config.highpass_cutoff_hz, config.filter_order
                )),
                params: vec![(
                    "highpass_cutoff_hz",
                    serde_json::json!(config.highpass_cutoff_hz),
                )],
                warning: None,
            }
        }
        None => StageOutcome {
            signal,
            descriptor: None,
            params: vec![],
            warning: Some("high-pass filter design failed, stage skipped".into()),
        },
    }
}

fn rectify_stage(signal: Vec<f64>, _fs: f64, config: &SignalConfig) -> StageOutcome {
    if !config.enable_rectification {
        return StageOutcome { signal, descriptor: None, params: vec![], warning: None };
    }
    let rectified = signal.iter().map(|v| v.abs()).collect();
    StageOutcome {
        signal: rectified,
        descriptor: Some("Full-wave rectification".into()),
        params: vec![("rectification_enabled", serde_json::json!(true))],
        warning: None,
    }
}

fn lowpass_stage(signal: Vec<f64>, fs: f64, config: &SignalConfig) -> StageOutcome {
    if !config.enable_filtering {
        return StageOutcome { signal, descriptor: None, params: vec![], warning: None };
    }
    let nyquist = fs / 2.0;
    // Clamp rather than skip: an envelope is still useful near Nyquist.
    let (cutoff, clamp_warning) = if config.lowpass_cutoff_hz >= nyquist {
        let corrected = 0.9 * nyquist;
        (
            corrected,
            Some(format!(
                "low-pass cutoff {}Hz >= fs/2 ({nyquist}Hz), clamped to {corrected}Hz",
                config.lowpass_cutoff_hz
            )),
        )
    } else {
        (config.lowpass_cutoff_hz, None)
    };

    match filters::butter(config.filter_order, cutoff / nyquist, Band::Lowpass) {
        Some(coeffs) => {
            let filtered = filters::filtfilt(&coeffs, &signal);
            StageOutcome {
                signal: filtered,
                descriptor: Some(format!(
                    "Low-pass filter for envelope: {cutoff}Hz, order {}",
                    config.filter_order
                )),
                params: vec![
                    ("lowpass_cutoff_hz", serde_json::json!(cutoff)),
                    ("filter_order", serde_json::json!(config.filter_order)),
                ],
                warning: clamp_warning,
            }
        }
        None => StageOutcome {
            signal,
            descriptor: None,
            params: vec![],
            warning: Some("low-pass filter design failed, stage skipped".into()),
        },
    }
}

fn smoothing_stage(signal: Vec<f64>, fs: f64, config: &SignalConfig) -> StageOutcome {
    if !config.enable_smoothing {
        return StageOutcome { signal, descriptor: None, params: vec![], warning: None };
    }
    let window_samples = ((config.smoothing_window_ms / 1000.0) * fs) as usize;
    if window_samples == 0 {
        return StageOutcome { signal, descriptor: None, params: vec![], warning: None };
    }
    let smoothed = moving_average_same(&signal, window_samples);
    StageOutcome {
        signal: smoothed,
        descriptor: Some(format!(
            "Moving average smoothing: {}ms window ({window_samples} samples)",
            config.smoothing_window_ms
        )),
        params: vec![
            ("smoothing_window_ms", serde_json::json!(config.smoothing_window_ms)),
            ("smoothing_window_samples", serde_json::json!(window_samples)),
        ],
        warning: None,
    }
}

/// "Same"-length convolution with a uniform window, zero-padded at the
/// edges. A window of 1 sample is the identity.
pub fn moving_average_same(signal: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 || signal.is_empty() {
        return signal.to_vec();
    }
    let n = signal.len();
    let k = window as f64;
    let left = (window - 1) / 2;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let lo = i.saturating_sub(left);
        let hi = (i + window - left).min(n);
        let sum: f64 = signal[lo..hi].iter().sum();
        out.push(sum / k);
    }
    out
}

// ============================================================================
// Pipeline
// ============================================================================

/// Run the full preprocessing chain on one raw channel.
pub fn preprocess_emg_signal(
    raw_signal: &[f64],
    sampling_rate: f64,
    config: &SignalConfig,
) -> ProcessedSignal {
    if let Err(err) = validate_signal_quality(raw_signal, sampling_rate) {
        warn!("signal quality rejection: {err}");
        return ProcessedSignal {
            signal: None,
            steps: Vec::new(),
            parameters_used: BTreeMap::new(),
            original_stats: Some(SignalStats::of(raw_signal)),
            processed_stats: None,
            warnings: Vec::new(),
            error: Some(err),
        };
    }

    let stages: [Stage; 4] = [highpass_stage, rectify_stage, lowpass_stage, smoothing_stage];

    let mut signal = raw_signal.to_vec();
    let mut steps = Vec::new();
    let mut parameters_used = BTreeMap::new();
    let mut warnings = Vec::new();

    for stage in stages {
        let outcome = stage(signal, sampling_rate, config);
        signal = outcome.signal;
        if let Some(desc) = outcome.descriptor {
            steps.push(desc);
        }
        for (key, value) in outcome.params {
            parameters_used.insert(key.to_string(), value);
        }
        if let Some(w) = outcome.warning {
            warn!("{w}");
            warnings.push(w);
        }
    }

    // Zero-phase filtering of a rectified signal can ring below zero; an
    // amplitude envelope is non-negative by definition.
    if config.enable_rectification {
        for v in signal.iter_mut() {
            *v = v.max(0.0);
        }
    }

    debug!("signal processing completed: {} steps applied", steps.len());

    ProcessedSignal {
        original_stats: Some(SignalStats::of(raw_signal)),
        processed_stats: Some(SignalStats::of(&signal)),
        signal: Some(signal),
        steps,
        parameters_used,
        warnings,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn emg_like(fs: f64, secs: f64) -> Vec<f64> {
        // 60 Hz carrier with a slow amplitude burst, plus DC offset.
        let n = (fs * secs) as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / fs;
                let burst = if (5.0..15.0).contains(&t) { 1.0 } else { 0.1 };
                0.5 + burst * (2.0 * PI * 60.0 * t).sin()
            })
            .collect()
    }

    #[test]
    fn quality_gate_minimum_samples_boundary() {
        let fs = 100.0; // 1000 samples = 10s, exactly at both lower bounds
        let ok: Vec<f64> = (0..1000).map(|i| (i as f64 * 0.1).sin()).collect();
        assert!(validate_signal_quality(&ok, fs).is_ok());

        let short: Vec<f64> = ok[..999].to_vec();
        let err = validate_signal_quality(&short, fs).unwrap_err();
        match err {
            AnalyzerError::SignalQuality { samples, .. } => assert_eq!(samples, 999),
            other => panic!("expected SignalQuality, got {other:?}"),
        }
    }

    #[test]
    fn quality_gate_rejects_flat_signal() {
        let flat = vec![0.42; 2000];
        let err = validate_signal_quality(&flat, 100.0).unwrap_err();
        assert!(err.to_string().contains("variation"));
    }

    #[test]
    fn quality_gate_rejects_non_finite() {
        let mut sig: Vec<f64> = (0..2000).map(|i| (i as f64 * 0.1).sin()).collect();
        sig[1500] = f64::NAN;
        let err = validate_signal_quality(&sig, 100.0).unwrap_err();
        assert!(err.to_string().contains("NaN"));
    }

    #[test]
    fn quality_gate_rejects_short_recording_with_facts() {
        // The real-world shape: 990Hz, 30 samples.
        let sig: Vec<f64> = (0..30).map(|i| (i as f64).sin()).collect();
        let err = validate_signal_quality(&sig, 990.0).unwrap_err();
        match err {
            AnalyzerError::SignalQuality {
                samples,
                duration_seconds,
                min_duration_seconds,
                max_duration_seconds,
                sampling_rate_hz,
                ..
            } => {
                assert_eq!(samples, 30);
                assert!((duration_seconds - 30.0 / 990.0).abs() < 1e-9);
                assert_eq!(min_duration_seconds, 10.0);
                assert_eq!(max_duration_seconds, 600.0);
                assert_eq!(sampling_rate_hz, 990.0);
            }
            other => panic!("expected SignalQuality, got {other:?}"),
        }
    }

    #[test]
    fn envelope_is_non_negative() {
        let raw = emg_like(1000.0, 20.0);
        let result = preprocess_emg_signal(&raw, 1000.0, &SignalConfig::default());
        let env = result.signal.expect("valid signal");
        assert!(env.iter().all(|&v| v >= 0.0), "envelope must be non-negative");
    }

    #[test]
    fn pipeline_records_steps_and_parameters() {
        let raw = emg_like(1000.0, 20.0);
        let result = preprocess_emg_signal(&raw, 1000.0, &SignalConfig::default());
        assert!(result.is_valid());
        assert_eq!(result.steps.len(), 4);
        assert!(result.steps[0].starts_with("High-pass"));
        assert_eq!(result.steps[1], "Full-wave rectification");
        assert!(result.steps[2].starts_with("Low-pass"));
        assert!(result.steps[3].starts_with("Moving average"));
        assert_eq!(
            result.parameters_used["highpass_cutoff_hz"],
            serde_json::json!(20.0)
        );
        assert_eq!(result.parameters_used["filter_order"], serde_json::json!(4));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn highpass_skipped_when_cutoff_at_nyquist() {
        let raw = emg_like(30.0, 40.0); // fs/2 = 15Hz < 20Hz cutoff
        let result = preprocess_emg_signal(&raw, 30.0, &SignalConfig::default());
        assert!(result.is_valid());
        assert!(!result.steps.iter().any(|s| s.starts_with("High-pass")));
        assert!(result.warnings.iter().any(|w| w.contains("high-pass")));
    }

    #[test]
    fn lowpass_cutoff_clamped_below_nyquist() {
        let config = SignalConfig {
            lowpass_cutoff_hz: 40.0,
            ..SignalConfig::default()
        };
        let raw = emg_like(60.0, 30.0); // nyquist 30Hz < 40Hz requested
        let result = preprocess_emg_signal(&raw, 60.0, &config);
        assert!(result.is_valid());
        let clamped = result.parameters_used["lowpass_cutoff_hz"].as_f64().unwrap();
        assert!((clamped - 27.0).abs() < 1e-9); // 0.9 * 30
        assert!(result.warnings.iter().any(|w| w.contains("clamped")));
    }

    #[test]
    fn window_of_one_sample_is_identity_after_rectification() {
        let config = SignalConfig {
            enable_filtering: false,
            smoothing_window_ms: 1.0, // 1ms at 1kHz = 1 sample
            ..SignalConfig::default()
        };
        let raw = emg_like(1000.0, 15.0);
        let result = preprocess_emg_signal(&raw, 1000.0, &config);
        let out = result.signal.unwrap();
        for (y, x) in out.iter().zip(raw.iter()) {
            assert!((y - x.abs()).abs() < 1e-12);
        }
    }

    #[test]
    fn moving_average_window_one_is_identity() {
        let x = vec![1.0, -2.0, 3.0];
        assert_eq!(moving_average_same(&x, 1), x);
    }

    #[test]
    fn moving_average_same_length() {
        let x: Vec<f64> = (0..100).map(|i| i as f64).collect();
        assert_eq!(moving_average_same(&x, 7).len(), 100);
    }
}
