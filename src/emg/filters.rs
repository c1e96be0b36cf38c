//! Butterworth filter design and zero-phase filtering
//!
//! Digital Butterworth design via the analog prototype, frequency pre-warp
//! and bilinear transform, applied forward-backward for zero phase shift.
//! Cutoffs are normalized to the Nyquist frequency (1.0 = fs/2).

use rustfft::num_complex::Complex64;

/// Filter band selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Lowpass,
    Highpass,
}

/// Designed transfer-function coefficients, `a[0]` normalized to 1.
#[derive(Debug, Clone)]
pub struct Coefficients {
    pub b: Vec<f64>,
    pub a: Vec<f64>,
}

/// Design an order-`n` digital Butterworth filter with normalized cutoff
/// `wn` in (0, 1), where 1.0 is the Nyquist frequency.
///
/// Returns `None` for out-of-range cutoffs; the caller decides whether to
/// skip the stage or clamp the cutoff first.
pub fn butter(n: usize, wn: f64, band: Band) -> Option<Coefficients> {
    if n == 0 || wn <= 0.0 || wn >= 1.0 {
        return None;
    }

    // Analog prototype: n poles on the left-half unit circle, no zeros.
    let mut poles: Vec<Complex64> = (1..=n)
        .map(|m| {
            let theta = std::f64::consts::PI * (2 * m + n - 1) as f64 / (2 * n) as f64;
            Complex64::new(theta.cos(), theta.sin())
        })
        .collect();
    let mut zeros: Vec<Complex64> = Vec::new();
    let mut gain = 1.0;

    // Pre-warp the cutoff (bilinear uses fs = 2).
    let warped = 4.0 * (std::f64::consts::PI * wn / 2.0).tan();

    match band {
        Band::Lowpass => {
            for p in poles.iter_mut() {
                *p *= warped;
            }
            gain *= warped.powi(n as i32);
        }
        Band::Highpass => {
            // s -> warped/s maps the prototype to a highpass; the constant
            // term of the Butterworth polynomial is 1, so the gain is kept.
            for p in poles.iter_mut() {
                *p = Complex64::new(warped, 0.0) / *p;
            }
            zeros = vec![Complex64::new(0.0, 0.0); n];
        }
    }

    // Bilinear transform (fs = 2, so fs2 = 4).
    let fs2 = Complex64::new(4.0, 0.0);
    let num: Complex64 = zeros.iter().map(|z| fs2 - z).product();
    let den: Complex64 = poles.iter().map(|p| fs2 - p).product();
    gain *= (num / den).re;

    let z_zeros: Vec<Complex64> = zeros.iter().map(|z| (fs2 + z) / (fs2 - z)).collect();
    let z_poles: Vec<Complex64> = poles.iter().map(|p| (fs2 + p) / (fs2 - p)).collect();

    // Excess poles become zeros at z = -1.
    let mut z_zeros = z_zeros;
    z_zeros.resize(n, Complex64::new(-1.0, 0.0));

    let b: Vec<f64> = poly(&z_zeros).iter().map(|c| c.re * gain).collect();
    let a: Vec<f64> = poly(&z_poles).iter().map(|c| c.re).collect();

    Some(Coefficients { b, a })
}

/// Expand a set of roots into monic polynomial coefficients, highest
/// degree first. Conjugate pairs cancel to real coefficients.
fn poly(roots: &[Complex64]) -> Vec<Complex64> {
    let mut coeffs = vec![Complex64::new(1.0, 0.0)];
    for r in roots {
        let mut next = vec![Complex64::new(0.0, 0.0); coeffs.len() + 1];
        for (i, c) in coeffs.iter().enumerate() {
            next[i] += c;
            next[i + 1] -= c * r;
        }
        coeffs = next;
    }
    coeffs
}

/// Single-pass IIR filter, direct form II transposed, zero initial state.
pub fn lfilter(coeffs: &Coefficients, x: &[f64]) -> Vec<f64> {
    let b = &coeffs.b;
    let a = &coeffs.a;
    let order = a.len().max(b.len()) - 1;
    let mut state = vec![0.0; order];
    let mut y = Vec::with_capacity(x.len());

    for &xn in x {
        let yn = b[0] * xn + state[0];
        for i in 0..order {
            let bi = if i + 1 < b.len() { b[i + 1] } else { 0.0 };
            let ai = if i + 1 < a.len() { a[i + 1] } else { 0.0 };
            let carry = if i + 1 < order { state[i + 1] } else { 0.0 };
            state[i] = bi * xn + carry - ai * yn;
        }
        y.push(yn);
    }
    y
}

/// Zero-phase filtering: forward pass, reverse, backward pass, reverse.
///
/// The signal is extended at both ends with an odd reflection so the filter
/// transient is absorbed by the padding rather than the data. Signals too
/// short to pad are returned unfiltered.
pub fn filtfilt(coeffs: &Coefficients, x: &[f64]) -> Vec<f64> {
    let ntaps = coeffs.a.len().max(coeffs.b.len());
    let padlen = 3 * (ntaps - 1);
    if x.len() <= padlen || padlen == 0 {
        return x.to_vec();
    }

    let n = x.len();
    let mut extended = Vec::with_capacity(n + 2 * padlen);
    for i in (1..=padlen).rev() {
        extended.push(2.0 * x[0] - x[i]);
    }
    extended.extend_from_slice(x);
    for i in 1..=padlen {
        extended.push(2.0 * x[n - 1] - x[n - 1 - i]);
    }

    let mut y = lfilter(coeffs, &extended);
    y.reverse();
    let mut y = lfilter(coeffs, &y);
    y.reverse();

    y[padlen..padlen + n].to_vec()
}
