//! Amplitude and spectral EMG metrics
//!
//! RMS and MAV amplitude statistics plus the frequency-domain fatigue
//! indicators: mean power frequency (MPF), median frequency (MDF), and a
//! fatigue index defined as the slope of MDF across consecutive analysis
//! windows. A decline in median frequency over a sustained effort is the
//! classic spectral signature of muscle fatigue.

use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

/// Window length for the fatigue trend, in seconds.
const FATIGUE_WINDOW_SECONDS: f64 = 1.0;

/// Frequency-domain and amplitude metrics for one channel.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SpectralMetrics {
    pub rms: f64,
    pub mav: f64,
    pub mpf_hz: f64,
    pub mdf_hz: f64,
    /// Slope of MDF across windows in Hz/s; negative values indicate fatigue.
    pub fatigue_index: f64,
}

/// Root-mean-square amplitude.
pub fn rms(signal: &[f64]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    (signal.iter().map(|v| v * v).sum::<f64>() / signal.len() as f64).sqrt()
}

/// Mean absolute value.
pub fn mav(signal: &[f64]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    signal.iter().map(|v| v.abs()).sum::<f64>() / signal.len() as f64
}

/// One-sided power spectrum with a Hann window. Returns `(freqs, power)`
/// excluding the DC bin, which only carries offset, not muscle activity.
pub fn power_spectrum(signal: &[f64], sampling_rate: f64) -> (Vec<f64>, Vec<f64>) {
    let n = signal.len();
    if n < 8 || sampling_rate <= 0.0 {
        return (Vec::new(), Vec::new());
    }

    let mut buffer: Vec<Complex64> = signal
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let w = 0.5
                - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / (n - 1) as f64).cos();
            Complex64::new(v * w, 0.0)
        })
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(n).process(&mut buffer);

    let half = n / 2;
    let freq_step = sampling_rate / n as f64;
    let freqs: Vec<f64> = (1..half).map(|k| k as f64 * freq_step).collect();
    let power: Vec<f64> = (1..half).map(|k| buffer[k].norm_sqr()).collect();
    (freqs, power)
}

/// Mean power frequency: the power-weighted centroid of the spectrum.
pub fn mean_power_frequency(signal: &[f64], sampling_rate: f64) -> f64 {
    let (freqs, power) = power_spectrum(signal, sampling_rate);
    let total: f64 = power.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    freqs
        .iter()
        .zip(power.iter())
        .map(|(f, p)| f * p)
        .sum::<f64>()
        / total
}

/// Median frequency: the frequency splitting spectral power in half.
pub fn median_frequency(signal: &[f64], sampling_rate: f64) -> f64 {
    let (freqs, power) = power_spectrum(signal, sampling_rate);
    let total: f64 = power.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let mut cumulative = 0.0;
    for (f, p) in freqs.iter().zip(power.iter()) {
        cumulative += p;
        if cumulative >= total / 2.0 {
            return *f;
        }
    }
    *freqs.last().unwrap_or(&0.0)
}

/// Least-squares line fit; returns `(slope, intercept)`.
pub fn linear_regression(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len() as f64;
    if points.len() < 2 {
        return (0.0, points.first().map(|p| p.1).unwrap_or(0.0));
    }
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    if sxx == 0.0 {
        return (0.0, mean_y);
    }
    let sxy: f64 = points
        .iter()
        .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
        .sum();
    let slope = sxy / sxx;
    (slope, mean_y - slope * mean_x)
}

/// Fatigue index: slope of the median frequency across 1-second windows,
/// in Hz per second. Requires at least two full windows; otherwise 0.
pub fn fatigue_index(signal: &[f64], sampling_rate: f64) -> f64 {
    let window = (FATIGUE_WINDOW_SECONDS * sampling_rate) as usize;
    if window == 0 || signal.len() < 2 * window {
        return 0.0;
    }
    let points: Vec<(f64, f64)> = signal
        .chunks_exact(window)
        .enumerate()
        .map(|(i, chunk)| {
            let t = i as f64 * FATIGUE_WINDOW_SECONDS;
            (t, median_frequency(chunk, sampling_rate))
        })
        .collect();
    linear_regression(&points).0
}

/// Compute the full metric set for one raw channel.
pub fn compute_spectral_metrics(signal: &[f64], sampling_rate: f64) -> SpectralMetrics {
    SpectralMetrics {
        rms: rms(signal),
        mav: mav(signal),
        mpf_hz: mean_power_frequency(signal, sampling_rate),
        mdf_hz: median_frequency(signal, sampling_rate),
        fatigue_index: fatigue_index(signal, sampling_rate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sine(freq_hz: f64, fs: f64, secs: f64) -> Vec<f64> {
        let n = (fs * secs) as usize;
        (0..n).map(|i| (2.0 * PI * freq_hz * i as f64 / fs).sin()).collect()
    }

    #[test]
    fn rms_of_unit_sine() {
        let x = sine(50.0, 1000.0, 2.0);
        assert!((rms(&x) - std::f64::consts::FRAC_1_SQRT_2).abs() < 0.01);
    }

    #[test]
    fn mav_of_unit_sine() {
        let x = sine(50.0, 1000.0, 2.0);
        // Mean |sin| = 2/pi
        assert!((mav(&x) - 2.0 / PI).abs() < 0.01);
    }

    #[test]
    fn empty_signal_yields_zero_metrics() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(mav(&[]), 0.0);
        assert_eq!(mean_power_frequency(&[], 1000.0), 0.0);
        assert_eq!(median_frequency(&[], 1000.0), 0.0);
    }

    #[test]
    fn spectral_peak_found_for_pure_tone() {
        let x = sine(80.0, 1000.0, 4.0);
        let mdf = median_frequency(&x, 1000.0);
        let mpf = mean_power_frequency(&x, 1000.0);
        assert!((mdf - 80.0).abs() < 2.0, "mdf={mdf}");
        assert!((mpf - 80.0).abs() < 2.0, "mpf={mpf}");
    }

    #[test]
    fn mixed_tones_median_between_them() {
        let fs = 1000.0;
        let a = sine(40.0, fs, 4.0);
        let b = sine(160.0, fs, 4.0);
        let mixed: Vec<f64> = a.iter().zip(b.iter()).map(|(x, y)| x + y).collect();
        // Equal-power tones: the median lands on or between the two peaks.
        let mdf = median_frequency(&mixed, fs);
        assert!((39.0..=161.0).contains(&mdf), "mdf={mdf}");
    }

    #[test]
    fn declining_frequency_gives_negative_fatigue_index() {
        // Chirp from 120Hz down to 60Hz over 10s: the MDF trend must fall.
        let fs = 1000.0;
        let n = (fs * 10.0) as usize;
        let mut phase = 0.0f64;
        let x: Vec<f64> = (0..n)
            .map(|i| {
                let t = i as f64 / fs;
                let freq = 120.0 - 6.0 * t;
                phase += 2.0 * PI * freq / fs;
                phase.sin()
            })
            .collect();
        let fi = fatigue_index(&x, fs);
        assert!(fi < -3.0, "expected clearly negative slope, got {fi}");
    }

    #[test]
    fn stable_frequency_gives_flat_fatigue_index() {
        let x = sine(90.0, 1000.0, 10.0);
        let fi = fatigue_index(&x, 1000.0);
        assert!(fi.abs() < 1.0, "expected ~0 slope, got {fi}");
    }

    #[test]
    fn fatigue_index_zero_for_short_signal() {
        let x = sine(90.0, 1000.0, 1.5);
        assert_eq!(fatigue_index(&x, 1000.0), 0.0);
    }

    #[test]
    fn linear_regression_recovers_line() {
        let points: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 3.0 * i as f64 + 1.0)).collect();
        let (slope, intercept) = linear_regression(&points);
        assert!((slope - 3.0).abs() < 1e-9);
        assert!((intercept - 1.0).abs() < 1e-9);
    }
}
