//! Scoring weight normalization
//!
//! Weights over the four top-level scoring components must always close to
//! 1.0 within a 1e-3 tolerance, including after redistribution when optional
//! components (effort, game) are unavailable. Sums like 0.40 + 0.25 + 0.20 +
//! 0.15 and their subset renormalizations are computed in decimal arithmetic
//! so binary-float drift cannot break the closure.

use crate::error::{AnalyzerError, Result, WeightErrorKind};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Acceptable deviation of a weight sum from 1.0.
pub const WEIGHT_TOLERANCE: f64 = 1e-3;

// ============================================================================
// Weight sets
// ============================================================================

/// Base weights: the four main components plus the three muscle-compliance
/// sub-weights. Both groups must each sum to 1.0 ± tolerance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoringWeights {
    pub compliance: f64,
    pub symmetry: f64,
    pub effort: f64,
    pub game: f64,
    pub completion: f64,
    pub intensity: f64,
    pub duration: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            compliance: 0.40,
            symmetry: 0.25,
            effort: 0.20,
            game: 0.15,
            completion: 0.333,
            intensity: 0.333,
            duration: 0.334,
        }
    }
}

/// Which main components have data this session.
/// Compliance and symmetry always derive from the EMG channels; effort
/// depends on an RPE and game on the points metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentAvailability {
    pub compliance: bool,
    pub symmetry: bool,
    pub effort: bool,
    pub game: bool,
}

impl ComponentAvailability {
    pub fn count(&self) -> usize {
        [self.compliance, self.symmetry, self.effort, self.game]
            .iter()
            .filter(|&&b| b)
            .count()
    }

    pub fn has_core(&self) -> bool {
        self.compliance && self.symmetry
    }
}

/// Weights renormalized over the available component subset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedWeights {
    pub compliance: f64,
    pub symmetry: f64,
    pub effort: Option<f64>,
    pub game: Option<f64>,
}

impl NormalizedWeights {
    pub fn sum(&self) -> f64 {
        self.compliance + self.symmetry + self.effort.unwrap_or(0.0) + self.game.unwrap_or(0.0)
    }
}

/// Detailed validation outcome, surfaced by the config API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightValidation {
    pub is_valid: bool,
    pub total_sum: f64,
    pub tolerance: f64,
    pub deviation: f64,
}

// ============================================================================
// Weight manager
// ============================================================================

#[derive(Debug, Clone)]
pub struct WeightManager {
    base: ScoringWeights,
    tolerance: Decimal,
}

impl WeightManager {
    /// Build a manager after validating both base weight groups.
    pub fn new(base: ScoringWeights) -> Result<Self> {
        let tolerance = Decimal::from_f64(WEIGHT_TOLERANCE).unwrap_or_default();
        let manager = Self { base, tolerance };
        manager.validate_base()?;
        Ok(manager)
    }

    pub fn base(&self) -> &ScoringWeights {
        &self.base
    }

    fn validate_base(&self) -> Result<()> {
        let main = dec(self.base.compliance)
            + dec(self.base.symmetry)
            + dec(self.base.effort)
            + dec(self.base.game);
        if (main - Decimal::ONE).abs() > self.tolerance {
            return Err(AnalyzerError::WeightValidation {
                kind: WeightErrorKind::NormalizationFailed,
                message: format!("main weights sum to {main}, expected 1.0 ± {}", self.tolerance),
            });
        }
        let sub = dec(self.base.completion) + dec(self.base.intensity) + dec(self.base.duration);
        if (sub - Decimal::ONE).abs() > self.tolerance {
            return Err(AnalyzerError::WeightValidation {
                kind: WeightErrorKind::NormalizationFailed,
                message: format!("sub weights sum to {sub}, expected 1.0 ± {}", self.tolerance),
            });
        }
        Ok(())
    }

    /// Renormalize the main weights over the available components.
    ///
    /// Guarantee: the returned weights sum to 1.0 ± tolerance. Missing
    /// components' weight is redistributed proportionally to the present
    /// ones. The two core components are required.
    pub fn normalize(&self, availability: ComponentAvailability) -> Result<NormalizedWeights> {
        if !availability.has_core() || availability.count() < 2 {
            return Err(AnalyzerError::WeightValidation {
                kind: WeightErrorKind::InsufficientComponents,
                message: "core components (compliance, symmetry) required for scoring".into(),
            });
        }

        let mut total = dec(self.base.compliance) + dec(self.base.symmetry);
        if availability.effort {
            total += dec(self.base.effort);
        }
        if availability.game {
            total += dec(self.base.game);
        }
        if total <= Decimal::ZERO {
            return Err(AnalyzerError::WeightValidation {
                kind: WeightErrorKind::NormalizationFailed,
                message: "total available weight is zero".into(),
            });
        }

        let weights = NormalizedWeights {
            compliance: to_f64(dec(self.base.compliance) / total),
            symmetry: to_f64(dec(self.base.symmetry) / total),
            effort: availability
                .effort
                .then(|| to_f64(dec(self.base.effort) / total)),
            game: availability.game.then(|| to_f64(dec(self.base.game) / total)),
        };

        let validation = self.validate(&weights);
        if !validation.is_valid {
            return Err(AnalyzerError::WeightValidation {
                kind: WeightErrorKind::NormalizationFailed,
                message: format!(
                    "normalized sum {} deviates by {} (> {})",
                    validation.total_sum, validation.deviation, validation.tolerance
                ),
            });
        }

        debug!(sum = validation.total_sum, "normalized scoring weights");
        Ok(weights)
    }

    pub fn validate(&self, weights: &NormalizedWeights) -> WeightValidation {
        let total = weights.sum();
        let deviation = total - 1.0;
        WeightValidation {
            is_valid: deviation.abs() <= WEIGHT_TOLERANCE,
            total_sum: total,
            tolerance: WEIGHT_TOLERANCE,
            deviation,
        }
    }
}

fn dec(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap_or_default()
}

fn to_f64(v: Decimal) -> f64 {
    v.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> ComponentAvailability {
        ComponentAvailability {
            compliance: true,
            symmetry: true,
            effort: true,
            game: true,
        }
    }

    #[test]
    fn default_weights_pass_validation() {
        WeightManager::new(ScoringWeights::default()).unwrap();
    }

    #[test]
    fn bad_base_weights_rejected() {
        let bad = ScoringWeights {
            compliance: 0.5,
            ..ScoringWeights::default()
        };
        match WeightManager::new(bad).unwrap_err() {
            AnalyzerError::WeightValidation { kind, .. } => {
                assert_eq!(kind, WeightErrorKind::NormalizationFailed);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn full_availability_returns_base_weights() {
        let manager = WeightManager::new(ScoringWeights::default()).unwrap();
        let w = manager.normalize(all()).unwrap();
        assert!((w.compliance - 0.40).abs() < 1e-9);
        assert!((w.symmetry - 0.25).abs() < 1e-9);
        assert!((w.effort.unwrap() - 0.20).abs() < 1e-9);
        assert!((w.game.unwrap() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn closure_holds_for_every_valid_subset() {
        let manager = WeightManager::new(ScoringWeights::default()).unwrap();
        for effort in [false, true] {
            for game in [false, true] {
                let w = manager
                    .normalize(ComponentAvailability {
                        compliance: true,
                        symmetry: true,
                        effort,
                        game,
                    })
                    .unwrap();
                assert!(
                    (w.sum() - 1.0).abs() <= WEIGHT_TOLERANCE,
                    "subset effort={effort} game={game} sums to {}",
                    w.sum()
                );
                assert_eq!(w.effort.is_some(), effort);
                assert_eq!(w.game.is_some(), game);
            }
        }
    }

    #[test]
    fn missing_game_redistributes_proportionally() {
        let manager = WeightManager::new(ScoringWeights::default()).unwrap();
        let w = manager
            .normalize(ComponentAvailability {
                compliance: true,
                symmetry: true,
                effort: true,
                game: false,
            })
            .unwrap();
        // 0.40/0.85, 0.25/0.85, 0.20/0.85
        assert!((w.compliance - 0.40 / 0.85).abs() < 1e-9);
        assert!((w.symmetry - 0.25 / 0.85).abs() < 1e-9);
        assert!((w.effort.unwrap() - 0.20 / 0.85).abs() < 1e-9);
        assert!(w.game.is_none());
    }

    #[test]
    fn missing_core_component_is_insufficient() {
        let manager = WeightManager::new(ScoringWeights::default()).unwrap();
        let err = manager
            .normalize(ComponentAvailability {
                compliance: true,
                symmetry: false,
                effort: true,
                game: true,
            })
            .unwrap_err();
        match err {
            AnalyzerError::WeightValidation { kind, .. } => {
                assert_eq!(kind, WeightErrorKind::InsufficientComponents);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn awkward_custom_weights_still_close() {
        // Weights whose binary-float sum drifts: 0.1+0.2+0.3+0.4.
        let manager = WeightManager::new(ScoringWeights {
            compliance: 0.1,
            symmetry: 0.2,
            effort: 0.3,
            game: 0.4,
            ..ScoringWeights::default()
        })
        .unwrap();
        for effort in [false, true] {
            for game in [false, true] {
                let w = manager
                    .normalize(ComponentAvailability {
                        compliance: true,
                        symmetry: true,
                        effort,
                        game,
                    })
                    .unwrap();
                assert!((w.sum() - 1.0).abs() <= WEIGHT_TOLERANCE);
            }
        }
    }
}
