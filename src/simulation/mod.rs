//! Impact and similarity analysis over trajectory history.
//!
//! Four projections are folded from the trajectory logs:
//!
//! | Projection | Captures |
//! |---|---|
//! | [`CoOccurrence`] | which entities appear together in trajectories |
//! | [`Transition`] | step-type to step-type sequencing counts |
//! | [`Signature`] | each trajectory's entity set and step pattern |
//! | [`OutcomeCorrelation`] | which trajectories (and so signatures) led to which outcomes |
//!
//! [`SimulationEngine`] answers blast-radius, similarity and what-if
//! queries from them. Every result carries a [`VersionStamp`].

mod engine;
mod projections;
mod scoring;

pub use engine::{
    AffectedEntity, BlastRadius, ChangeSimulation, Evidence, SimilarTrajectories,
    SimilarTrajectory, SimulationEngine, VersionStamp,
};
pub use projections::{
    CoOccurrence, CoOccurrenceView, OutcomeCorrelation, OutcomeCorrelationView, Signature,
    SignatureView, TrajectorySignature, Transition, TransitionTable, TransitionView,
};

/// Version of the scoring algorithms.
pub const ALGORITHM_VERSION: u32 = 1;

/// Version of the features the projections extract.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Sample size at which confidence reaches 0.5.
pub const CONFIDENCE_HALF_SATURATION: f64 = 5.0;

/// Maximum evidence entries per result.
pub const MAX_EVIDENCE: usize = 10;

/// Share of similarity given to entity overlap; the rest goes to the step
/// pattern.
pub const ENTITY_SIMILARITY_WEIGHT: f64 = 0.5;

/// Outcome kind treated as success when scoring entity risk.
pub const SUCCESS_OUTCOME: &str = "success";
