//! Contraction detection and classification
//!
//! Detects supra-threshold runs in the RMS envelope, merges runs separated
//! by less than a hysteresis gap, discards runs shorter than a minimum
//! duration, and classifies each kept contraction against the MVC amplitude
//! and therapeutic duration thresholds when those are supplied.

use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractionConfig {
    /// Detection threshold as a fraction of the envelope maximum.
    pub threshold_factor: f64,
    /// Runs shorter than this are discarded.
    pub min_duration_ms: f64,
    /// Runs separated by less than this gap are merged into one.
    pub merge_gap_ms: f64,
    /// Absolute amplitude a contraction must reach to count as MVC-compliant.
    pub mvc_amplitude_threshold: Option<f64>,
    /// Duration a contraction must sustain to count as duration-compliant.
    pub duration_threshold_ms: Option<f64>,
}

impl Default for ContractionConfig {
    fn default() -> Self {
        Self {
            threshold_factor: crate::config::DEFAULT_THRESHOLD_FACTOR,
            min_duration_ms: crate::config::DEFAULT_MIN_CONTRACTION_MS,
            merge_gap_ms: crate::config::DEFAULT_MERGE_GAP_MS,
            mvc_amplitude_threshold: None,
            duration_threshold_ms: None,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// One detected contraction. A contraction can only be "good" against
/// supplied criteria: an absent threshold leaves its flag false.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contraction {
    pub start_ms: f64,
    pub end_ms: f64,
    pub duration_ms: f64,
    pub mean_amplitude: f64,
    pub max_amplitude: f64,
    pub meets_mvc: bool,
    pub meets_duration: bool,
    pub is_good: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractionAnalysis {
    pub contraction_count: usize,
    pub mvc_compliant_count: usize,
    pub duration_compliant_count: usize,
    pub good_contraction_count: usize,
    pub contractions: Vec<Contraction>,
}

impl ContractionAnalysis {
    /// Sum of all contraction durations (time under tension).
    pub fn total_time_under_tension_ms(&self) -> f64 {
        self.contractions.iter().map(|c| c.duration_ms).sum()
    }

    pub fn mean_duration_ms(&self) -> f64 {
        if self.contractions.is_empty() {
            return 0.0;
        }
        self.total_time_under_tension_ms() / self.contractions.len() as f64
    }

    pub fn min_duration_ms(&self) -> f64 {
        if self.contractions.is_empty() {
            return 0.0;
        }
        self.contractions
            .iter()
            .map(|c| c.duration_ms)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn max_duration_ms(&self) -> f64 {
        self.contractions
            .iter()
            .map(|c| c.duration_ms)
            .fold(0.0, f64::max)
    }

    pub fn mean_amplitude(&self) -> f64 {
        if self.contractions.is_empty() {
            return 0.0;
        }
        self.contractions.iter().map(|c| c.mean_amplitude).sum::<f64>()
            / self.contractions.len() as f64
    }

    pub fn max_amplitude(&self) -> f64 {
        self.contractions
            .iter()
            .map(|c| c.max_amplitude)
            .fold(0.0, f64::max)
    }
}

// ============================================================================
// Detection
// ============================================================================

/// Analyze an RMS envelope for contractions.
///
/// The detection threshold is `threshold_factor * max(envelope)`; a flat or
/// empty envelope yields no contractions. Sample index ranges are half-open;
/// where two merged runs met, the earlier run owns the boundary sample.
pub fn analyze_contractions(
    envelope: &[f64],
    sampling_rate: f64,
    config: &ContractionConfig,
) -> ContractionAnalysis {
    if envelope.is_empty() || sampling_rate <= 0.0 {
        return ContractionAnalysis::default();
    }

    let peak = envelope.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(peak > 0.0) {
        return ContractionAnalysis::default();
    }
    let threshold = config.threshold_factor * peak;

    let ms_per_sample = 1000.0 / sampling_rate;
    let min_samples = (config.min_duration_ms / ms_per_sample).round().max(1.0) as usize;
    let merge_gap_samples = (config.merge_gap_ms / ms_per_sample).round() as usize;

    // Step 1: supra-threshold runs as half-open [start, end) index ranges.
    let mut runs: Vec<(usize, usize)> = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &v) in envelope.iter().enumerate() {
        match (start, v >= threshold) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                runs.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, envelope.len()));
    }

    // Step 2: merge runs separated by less than the hysteresis gap.
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for run in runs {
        match merged.last_mut() {
            Some(prev) if run.0 - prev.1 < merge_gap_samples => prev.1 = run.1,
            _ => merged.push(run),
        }
    }

    // Step 3: discard runs shorter than the minimum duration.
    merged.retain(|(s, e)| e - s >= min_samples);

    // Step 4: classify.
    let mut analysis = ContractionAnalysis::default();
    for (s, e) in merged {
        let segment = &envelope[s..e];
        let duration_ms = (e - s) as f64 * ms_per_sample;
        let mean_amplitude = segment.iter().sum::<f64>() / segment.len() as f64;
        let max_amplitude = segment.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        let meets_mvc = config
            .mvc_amplitude_threshold
            .map(|t| max_amplitude >= t)
            .unwrap_or(false);
        let meets_duration = config
            .duration_threshold_ms
            .map(|t| duration_ms >= t)
            .unwrap_or(false);
        let is_good = meets_mvc && meets_duration;

        if meets_mvc {
            analysis.mvc_compliant_count += 1;
        }
        if meets_duration {
            analysis.duration_compliant_count += 1;
        }
        if is_good {
            analysis.good_contraction_count += 1;
        }
        analysis.contractions.push(Contraction {
            start_ms: s as f64 * ms_per_sample,
            end_ms: e as f64 * ms_per_sample,
            duration_ms,
            mean_amplitude,
            max_amplitude,
            meets_mvc,
            meets_duration,
            is_good,
        });
    }
    analysis.contraction_count = analysis.contractions.len();
    analysis
}
