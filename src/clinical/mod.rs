//! Clinical domain
//!
//! Everything that turns EMG analysis into clinical meaning: performance
//! scoring with weight normalization, temporal adherence, and the session
//! processor orchestrating ingestion.

pub mod adherence;
pub mod scoring;
pub mod session_processor;
pub mod weights;

pub use adherence::{calculate_adherence, AdherenceCategory, AdherenceReport};
pub use scoring::{
    rpe_effort_score, MuscleMetrics, RpeSource, ScoreResult, ScoringEngine, SessionMetrics,
};
pub use session_processor::{
    ChannelAnalytics, FastPathOutcome, ProcessorServices, SessionAnalytics,
    TherapySessionProcessor,
};
pub use weights::{ComponentAvailability, NormalizedWeights, ScoringWeights, WeightManager};
