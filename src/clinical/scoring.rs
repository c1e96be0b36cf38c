//! Performance scoring engine
//!
//! Turns per-session contraction metrics into the four-component clinical
//! score: compliance (how well each muscle met the protocol), symmetry
//! (bilateral balance), effort (RPE-derived) and game (points achieved).
//! All scores and rates live on the [0, 1] scale; the six per-side rates
//! are clamped to 1.0 before persistence to satisfy the database check
//! constraint.

use crate::clinical::weights::{ComponentAvailability, ScoringWeights, WeightManager};
use crate::error::{AnalyzerError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

// ============================================================================
// RPE mapping
// ============================================================================

/// Map a Borg CR-10 rating of perceived exertion to an effort score.
/// RPE 4-6 is the optimal therapeutic window; scores fall off toward no
/// exertion (0) and maximal exertion (10).
pub fn rpe_effort_score(rpe: u8) -> f64 {
    match rpe {
        0 => 0.10,
        1 => 0.25,
        2 => 0.40,
        3 => 0.70,
        4..=6 => 1.00,
        7 => 0.70,
        8 => 0.40,
        9 => 0.25,
        _ => 0.10,
    }
}

/// The default mapping as stored in `scoring_configuration.rpe_mapping`.
pub fn default_rpe_mapping() -> serde_json::Value {
    serde_json::json!({
        "0":  {"score": 10,  "category": "no_exertion"},
        "1":  {"score": 25,  "category": "very_light"},
        "2":  {"score": 40,  "category": "light"},
        "3":  {"score": 70,  "category": "moderate_low"},
        "4":  {"score": 100, "category": "optimal_low"},
        "5":  {"score": 100, "category": "optimal_moderate"},
        "6":  {"score": 100, "category": "optimal_high"},
        "7":  {"score": 70,  "category": "vigorous"},
        "8":  {"score": 40,  "category": "very_vigorous"},
        "9":  {"score": 25,  "category": "near_maximum"},
        "10": {"score": 10,  "category": "maximum"},
    })
}

/// Where the RPE used for the effort component came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpeSource {
    /// Patient-reported value.
    Reported,
    /// Substituted default; downstream consumers can filter synthetic effort.
    Default,
}

// ============================================================================
// Inputs
// ============================================================================

/// Per-side contraction tallies from one channel's analysis.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MuscleMetrics {
    pub total_contractions: u32,
    pub mvc_compliant: u32,
    pub duration_compliant: u32,
}

/// Everything the scoring engine needs, assembled in memory by the session
/// processor from the just-computed analytics (never re-read from the
/// database, whose child rows may not be visible yet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: Uuid,
    pub left: MuscleMetrics,
    pub right: MuscleMetrics,
    pub expected_contractions_per_muscle: u32,
    pub bfr_compliant: bool,
    pub rpe_post_session: Option<u8>,
    pub game_points_achieved: Option<u32>,
    pub game_points_max: Option<u32>,
}

// ============================================================================
// Outputs
// ============================================================================

/// Per-side intermediate rates, each already clamped to [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SideRates {
    pub completion: f64,
    pub intensity: f64,
    pub duration: f64,
    pub muscle_compliance: f64,
}

/// The complete score row written to `performance_scores`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResult {
    pub session_id: Uuid,
    pub overall_score: f64,
    pub compliance_score: f64,
    pub symmetry_score: f64,
    pub effort_score: f64,
    pub game_score: Option<f64>,
    pub left_muscle_compliance: f64,
    pub right_muscle_compliance: f64,
    pub completion_rate_left: f64,
    pub completion_rate_right: f64,
    pub intensity_rate_left: f64,
    pub intensity_rate_right: f64,
    pub duration_rate_left: f64,
    pub duration_rate_right: f64,
    pub bfr_compliant: bool,
    pub rpe_post_session: u8,
    pub rpe_source: RpeSource,
    pub scoring_config_id: Option<Uuid>,
}

impl ScoreResult {
    /// Clamp every rate field to [0, 1]. The engine already produces clamped
    /// rates; this runs immediately before the persistence write because the
    /// database enforces `rate <= 1.0` as a check constraint.
    pub fn clamp_rates(&mut self) {
        for rate in [
            &mut self.completion_rate_left,
            &mut self.completion_rate_right,
            &mut self.intensity_rate_left,
            &mut self.intensity_rate_right,
            &mut self.duration_rate_left,
            &mut self.duration_rate_right,
            &mut self.left_muscle_compliance,
            &mut self.right_muscle_compliance,
        ] {
            *rate = rate.clamp(0.0, 1.0);
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct ScoringEngine {
    weights: WeightManager,
    default_rpe: u8,
    scoring_config_id: Option<Uuid>,
}

impl ScoringEngine {
    pub fn new(weights: ScoringWeights, default_rpe: u8) -> Result<Self> {
        Ok(Self {
            weights: WeightManager::new(weights)?,
            default_rpe,
            scoring_config_id: None,
        })
    }

    pub fn with_config_id(mut self, id: Uuid) -> Self {
        self.scoring_config_id = Some(id);
        self
    }

    /// Compute the full score bundle for one session.
    pub fn compute(&self, metrics: &SessionMetrics) -> Result<ScoreResult> {
        if metrics.expected_contractions_per_muscle == 0 {
            return Err(AnalyzerError::ScoringInput(
                "expected contractions per muscle must be positive".into(),
            ));
        }

        let left = self.side_rates(&metrics.left, metrics.expected_contractions_per_muscle);
        let right = self.side_rates(&metrics.right, metrics.expected_contractions_per_muscle);

        let compliance = (left.muscle_compliance + right.muscle_compliance) / 2.0;
        let symmetry = symmetry_score(
            metrics.left.total_contractions,
            metrics.right.total_contractions,
        );

        let (rpe, rpe_source) = match metrics.rpe_post_session {
            Some(value) => (value, RpeSource::Reported),
            None => {
                info!(default_rpe = self.default_rpe, "no RPE reported, substituting default");
                (self.default_rpe, RpeSource::Default)
            }
        };
        let effort = rpe_effort_score(rpe);

        let game = match (metrics.game_points_achieved, metrics.game_points_max) {
            (Some(achieved), Some(max)) if max > 0 => {
                Some((achieved as f64 / max as f64).clamp(0.0, 1.0))
            }
            _ => None,
        };

        let weights = self.weights.normalize(ComponentAvailability {
            compliance: true,
            symmetry: true,
            effort: true,
            game: game.is_some(),
        })?;

        let mut overall = weights.compliance * compliance + weights.symmetry * symmetry;
        if let Some(w) = weights.effort {
            overall += w * effort;
        }
        if let (Some(w), Some(g)) = (weights.game, game) {
            overall += w * g;
        }

        debug!(
            overall,
            compliance, symmetry, effort, "session scores computed"
        );

        let mut result = ScoreResult {
            session_id: metrics.session_id,
            overall_score: overall,
            compliance_score: compliance,
            symmetry_score: symmetry,
            effort_score: effort,
            game_score: game,
            left_muscle_compliance: left.muscle_compliance,
            right_muscle_compliance: right.muscle_compliance,
            completion_rate_left: left.completion,
            completion_rate_right: right.completion,
            intensity_rate_left: left.intensity,
            intensity_rate_right: right.intensity,
            duration_rate_left: left.duration,
            duration_rate_right: right.duration,
            bfr_compliant: metrics.bfr_compliant,
            rpe_post_session: rpe,
            rpe_source,
            scoring_config_id: self.scoring_config_id,
        };
        result.clamp_rates();
        Ok(result)
    }

    fn side_rates(&self, side: &MuscleMetrics, expected: u32) -> SideRates {
        let total = side.total_contractions as f64;
        let completion = (total / expected as f64).clamp(0.0, 1.0);
        let intensity = if total > 0.0 {
            (side.mvc_compliant as f64 / total).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let duration = if total > 0.0 {
            (side.duration_compliant as f64 / total).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let base = self.weights.base();
        SideRates {
            completion,
            intensity,
            duration,
            muscle_compliance: base.completion * completion
                + base.intensity * intensity
                + base.duration * duration,
        }
    }
}

/// Bilateral balance of contraction counts; 1.0 when both sides are silent.
fn symmetry_score(left_total: u32, right_total: u32) -> f64 {
    let (l, r) = (left_total as f64, right_total as f64);
    if l + r == 0.0 {
        return 1.0;
    }
    1.0 - (l - r).abs() / (l + r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clinical::weights::ScoringWeights;

    fn engine() -> ScoringEngine {
        ScoringEngine::new(ScoringWeights::default(), 4).unwrap()
    }

    fn bilateral_metrics() -> SessionMetrics {
        SessionMetrics {
            session_id: Uuid::new_v4(),
            left: MuscleMetrics {
                total_contractions: 20,
                mvc_compliant: 20,
                duration_compliant: 0,
            },
            right: MuscleMetrics {
                total_contractions: 9,
                mvc_compliant: 9,
                duration_compliant: 0,
            },
            expected_contractions_per_muscle: 12,
            bfr_compliant: true,
            rpe_post_session: Some(5),
            game_points_achieved: None,
            game_points_max: None,
        }
    }

    #[test]
    fn asymmetric_session_rates_and_symmetry() {
        let score = engine().compute(&bilateral_metrics()).unwrap();
        assert_eq!(score.intensity_rate_left, 1.0);
        assert_eq!(score.intensity_rate_right, 1.0);
        assert_eq!(score.duration_rate_left, 0.0);
        assert_eq!(score.duration_rate_right, 0.0);
        // 20/12 clamps to 1.0
        assert_eq!(score.completion_rate_left, 1.0);
        assert!((score.completion_rate_right - 0.75).abs() < 1e-9);
        assert!(
            score.symmetry_score > 0.6 && score.symmetry_score < 0.8,
            "symmetry {}",
            score.symmetry_score
        );
    }

    #[test]
    fn missing_rpe_substitutes_default() {
        let mut metrics = bilateral_metrics();
        metrics.rpe_post_session = None;
        let score = engine().compute(&metrics).unwrap();
        assert_eq!(score.rpe_post_session, 4);
        assert_eq!(score.rpe_source, RpeSource::Default);
        assert_eq!(score.effort_score, 1.0);
        assert!(score.overall_score > 0.0);
    }

    #[test]
    fn reported_rpe_is_not_synthetic() {
        let score = engine().compute(&bilateral_metrics()).unwrap();
        assert_eq!(score.rpe_source, RpeSource::Reported);
        assert_eq!(score.rpe_post_session, 5);
    }

    #[test]
    fn all_rates_at_most_one() {
        let mut metrics = bilateral_metrics();
        metrics.left.mvc_compliant = 40; // more compliant than total
        metrics.left.duration_compliant = 50;
        let score = engine().compute(&metrics).unwrap();
        for rate in [
            score.completion_rate_left,
            score.completion_rate_right,
            score.intensity_rate_left,
            score.intensity_rate_right,
            score.duration_rate_left,
            score.duration_rate_right,
            score.left_muscle_compliance,
            score.right_muscle_compliance,
        ] {
            assert!((0.0..=1.0).contains(&rate), "rate {rate} outside [0,1]");
        }
    }

    #[test]
    fn zero_contractions_zero_rates_full_symmetry() {
        let metrics = SessionMetrics {
            session_id: Uuid::new_v4(),
            left: MuscleMetrics::default(),
            right: MuscleMetrics::default(),
            expected_contractions_per_muscle: 12,
            bfr_compliant: false,
            rpe_post_session: Some(4),
            game_points_achieved: None,
            game_points_max: None,
        };
        let score = engine().compute(&metrics).unwrap();
        assert_eq!(score.intensity_rate_left, 0.0);
        assert_eq!(score.duration_rate_right, 0.0);
        assert_eq!(score.symmetry_score, 1.0);
    }

    #[test]
    fn game_score_included_when_points_present() {
        let mut metrics = bilateral_metrics();
        metrics.game_points_achieved = Some(150);
        metrics.game_points_max = Some(200);
        let score = engine().compute(&metrics).unwrap();
        assert_eq!(score.game_score, Some(0.75));

        // With the full component set, the overall is the plain weighted sum.
        let expected = 0.40 * score.compliance_score
            + 0.25 * score.symmetry_score
            + 0.20 * score.effort_score
            + 0.15 * 0.75;
        assert!((score.overall_score - expected).abs() < 1e-6);
    }

    #[test]
    fn game_unavailable_redistributes_weights() {
        let score = engine().compute(&bilateral_metrics()).unwrap();
        assert!(score.game_score.is_none());
        let expected = (0.40 * score.compliance_score
            + 0.25 * score.symmetry_score
            + 0.20 * score.effort_score)
            / 0.85;
        assert!((score.overall_score - expected).abs() < 1e-6);
    }

    #[test]
    fn zero_expected_contractions_is_scoring_input_error() {
        let mut metrics = bilateral_metrics();
        metrics.expected_contractions_per_muscle = 0;
        match engine().compute(&metrics).unwrap_err() {
            AnalyzerError::ScoringInput(_) => {}
            other => panic!("expected ScoringInput, got {other:?}"),
        }
    }

    #[test]
    fn rpe_mapping_optimal_window() {
        assert_eq!(rpe_effort_score(4), 1.0);
        assert_eq!(rpe_effort_score(5), 1.0);
        assert_eq!(rpe_effort_score(6), 1.0);
        assert_eq!(rpe_effort_score(0), 0.10);
        assert_eq!(rpe_effort_score(10), 0.10);
        assert!(rpe_effort_score(3) > rpe_effort_score(2));
        assert!(rpe_effort_score(7) < rpe_effort_score(6));
    }
}
