//! Temporal adherence scoring
//!
//! Compares sessions completed to date against the linear protocol
//! baseline. The caller supplies the protocol day; this module never reads
//! the clock, which keeps adherence reproducible in tests and backfills.

use serde::{Deserialize, Serialize};

/// Clinical adherence bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdherenceCategory {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl AdherenceCategory {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= 90.0 {
            AdherenceCategory::Excellent
        } else if percent >= 75.0 {
            AdherenceCategory::Good
        } else if percent >= 50.0 {
            AdherenceCategory::Fair
        } else {
            AdherenceCategory::Poor
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdherenceReport {
    pub protocol_day: u32,
    pub expected_sessions: f64,
    pub completed_sessions: u32,
    /// Percentage in [0, 100].
    pub adherence_score: f64,
    pub category: AdherenceCategory,
    pub total_sessions_planned: u32,
    pub trial_duration_days: u32,
}

/// Compute the adherence score for a patient on a given protocol day.
///
/// `expected_sessions(day) = planned_total / trial_length * day`; the ratio
/// of completed to expected is clamped to [0, 1] and scaled to percent. Day
/// zero has no baseline yet and reports full adherence.
pub fn calculate_adherence(
    total_sessions_planned: u32,
    trial_duration_days: u32,
    protocol_day: u32,
    completed_sessions: u32,
) -> AdherenceReport {
    let trial_days = trial_duration_days.max(1);
    let expected = total_sessions_planned as f64 / trial_days as f64 * protocol_day as f64;

    let ratio = if expected > 0.0 {
        (completed_sessions as f64 / expected).clamp(0.0, 1.0)
    } else {
        1.0
    };
    let percent = ratio * 100.0;

    AdherenceReport {
        protocol_day,
        expected_sessions: expected,
        completed_sessions,
        adherence_score: percent,
        category: AdherenceCategory::from_percent(percent),
        total_sessions_planned,
        trial_duration_days: trial_days,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_track_patient_is_excellent() {
        // 30 sessions over 14 days: ~2.14/day expected.
        let report = calculate_adherence(30, 14, 7, 15);
        assert!((report.expected_sessions - 15.0).abs() < 1e-9);
        assert!((report.adherence_score - 100.0).abs() < 1e-9);
        assert_eq!(report.category, AdherenceCategory::Excellent);
    }

    #[test]
    fn ahead_of_schedule_clamps_to_hundred() {
        let report = calculate_adherence(30, 14, 3, 12);
        assert!(report.adherence_score <= 100.0);
        assert_eq!(report.category, AdherenceCategory::Excellent);
    }

    #[test]
    fn half_done_is_fair() {
        let report = calculate_adherence(30, 14, 14, 15);
        assert!((report.adherence_score - 50.0).abs() < 1.0);
        assert_eq!(report.category, AdherenceCategory::Fair);
    }

    #[test]
    fn nothing_done_is_poor() {
        let report = calculate_adherence(30, 14, 10, 0);
        assert_eq!(report.adherence_score, 0.0);
        assert_eq!(report.category, AdherenceCategory::Poor);
    }

    #[test]
    fn category_thresholds() {
        assert_eq!(AdherenceCategory::from_percent(90.0), AdherenceCategory::Excellent);
        assert_eq!(AdherenceCategory::from_percent(89.9), AdherenceCategory::Good);
        assert_eq!(AdherenceCategory::from_percent(75.0), AdherenceCategory::Good);
        assert_eq!(AdherenceCategory::from_percent(74.9), AdherenceCategory::Fair);
        assert_eq!(AdherenceCategory::from_percent(50.0), AdherenceCategory::Fair);
        assert_eq!(AdherenceCategory::from_percent(49.9), AdherenceCategory::Poor);
    }

    #[test]
    fn day_zero_has_no_baseline() {
        let report = calculate_adherence(30, 14, 0, 0);
        assert_eq!(report.expected_sessions, 0.0);
        assert_eq!(report.adherence_score, 100.0);
    }

    #[test]
    fn zero_trial_length_does_not_divide_by_zero() {
        let report = calculate_adherence(30, 0, 5, 5);
        assert!(report.expected_sessions.is_finite());
        assert_eq!(report.trial_duration_days, 1);
    }
}
