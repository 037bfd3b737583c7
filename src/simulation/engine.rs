use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::projection::{EventSource, rebuild_one};
use crate::simulation::projections::{
    CoOccurrence, CoOccurrenceView, OutcomeCorrelation, OutcomeCorrelationView, Signature,
    SignatureView, Transition, TransitionTable,
};
use crate::simulation::scoring::{
    by_score_desc, jaccard, normalize, pattern_similarity, saturation,
};
use crate::simulation::{
    ALGORITHM_VERSION, ENTITY_SIMILARITY_WEIGHT, FEATURE_SCHEMA_VERSION, MAX_EVIDENCE,
    SUCCESS_OUTCOME,
};
use crate::trajectory::TrajectoryRecord;

/// Algorithm and feature-schema versions a result was computed under.
///
/// Results carrying different stamps are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStamp {
    pub algorithm_version: u32,
    pub feature_schema_version: u32,
}

impl VersionStamp {
    /// The stamp of this build.
    pub const CURRENT: VersionStamp = VersionStamp {
        algorithm_version: ALGORITHM_VERSION,
        feature_schema_version: FEATURE_SCHEMA_VERSION,
    };
}

/// A trajectory that informed a result, with how much it counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub trajectory_id: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedEntity {
    pub entity_ref: String,
    /// Share of the queried entity's trajectories that also touched this one.
    pub impact_score: f64,
    pub shared_trajectories: usize,
}

/// Result of [`SimulationEngine::blast_radius`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlastRadius {
    pub entity_ref: String,
    /// Highest impact first.
    pub affected_entities: Vec<AffectedEntity>,
    /// Outcome kind -> probability; empty when no outcome was observed.
    pub predicted_outcomes: BTreeMap<String, f64>,
    pub confidence: f64,
    pub sample_size: usize,
    pub evidence: Vec<Evidence>,
    pub version: VersionStamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarTrajectory {
    pub trajectory_id: String,
    /// Blend of `entity_overlap` and `pattern_similarity`, in `[0, 1]`.
    pub similarity: f64,
    pub entity_overlap: f64,
    pub pattern_similarity: f64,
}

/// Result of [`SimulationEngine::similar_trajectories`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarTrajectories {
    /// Most similar first; trajectories with zero similarity are omitted.
    pub matches: Vec<SimilarTrajectory>,
    pub confidence: f64,
    pub sample_size: usize,
    pub evidence: Vec<Evidence>,
    pub version: VersionStamp,
}

/// Result of [`SimulationEngine::simulate_change`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSimulation {
    /// Outcome kind -> probability, summing to 1; empty without data.
    pub predicted_outcomes: BTreeMap<String, f64>,
    /// `entity:<ref>` and `transition:<from>-><to>` -> share of the total
    /// risk, summing to 1; empty when nothing looks risky.
    pub risk_factors: BTreeMap<String, f64>,
    pub confidence: f64,
    pub sample_size: usize,
    pub evidence: Vec<Evidence>,
    pub version: VersionStamp,
}

/// Read-only what-if queries over trajectory history.
///
/// Built once from the four trajectory projections; every query is a pure
/// function of them, so results are deterministic until the engine is
/// rebuilt. Queries with no supporting trajectories return `confidence`
/// 0.0 and `sample_size` 0 rather than failing.
#[derive(Debug, Clone)]
pub struct SimulationEngine {
    co_occurrence: CoOccurrenceView,
    transitions: TransitionTable,
    signatures: SignatureView,
    outcomes: OutcomeCorrelationView,
}

impl SimulationEngine {
    /// Fold every projection over `source` and build an engine from them.
    pub async fn build<S>(source: &S) -> Result<Self>
    where
        S: EventSource<TrajectoryRecord>,
    {
        let co_occurrence = rebuild_one(&CoOccurrence, source).await?.data;
        let transitions = rebuild_one(&Transition, source).await?.data.table();
        let signatures = rebuild_one(&Signature, source).await?.data;
        let outcomes = rebuild_one(&OutcomeCorrelation, source).await?.data;
        tracing::debug!(
            trajectories = signatures.signatures.len(),
            entities = co_occurrence.trajectories_by_entity.len(),
            "simulation engine built"
        );
        Ok(Self::from_projections(
            co_occurrence,
            transitions,
            signatures,
            outcomes,
        ))
    }

    /// Assemble an engine from already-folded projections.
    pub fn from_projections(
        co_occurrence: CoOccurrenceView,
        transitions: TransitionTable,
        signatures: SignatureView,
        outcomes: OutcomeCorrelationView,
    ) -> Self {
        Self {
            co_occurrence,
            transitions,
            signatures,
            outcomes,
        }
    }

    /// Outcome kind counts per signature fingerprint.
    pub fn outcomes_by_signature(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        self.outcomes.by_signature(&self.signatures)
    }

    /// Entities likely affected by a change to `entity_ref`.
    pub fn blast_radius(&self, entity_ref: &str) -> BlastRadius {
        let trajectories = self
            .co_occurrence
            .trajectories_with(entity_ref)
            .cloned()
            .unwrap_or_default();
        let sample_size = trajectories.len();
        if sample_size == 0 {
            return BlastRadius {
                entity_ref: entity_ref.to_owned(),
                affected_entities: Vec::new(),
                predicted_outcomes: BTreeMap::new(),
                confidence: 0.0,
                sample_size: 0,
                evidence: Vec::new(),
                version: VersionStamp::CURRENT,
            };
        }

        let mut affected_entities: Vec<AffectedEntity> = self
            .co_occurrence
            .co_occurrences(entity_ref)
            .into_iter()
            .map(|(entity, shared)| AffectedEntity {
                entity_ref: entity,
                impact_score: shared as f64 / sample_size as f64,
                shared_trajectories: shared,
            })
            .collect();
        affected_entities.sort_by(|a, b| {
            by_score_desc(
                (a.impact_score, a.entity_ref.as_str()),
                (b.impact_score, b.entity_ref.as_str()),
            )
        });

        // Weight by how many other entities each trajectory touched; even
        // split when none touched anything else.
        let breadth: BTreeMap<&str, f64> = trajectories
            .iter()
            .map(|id| {
                let others = self
                    .co_occurrence
                    .entities_by_trajectory
                    .get(id)
                    .map_or(0, |e| e.len().saturating_sub(1));
                (id.as_str(), others as f64)
            })
            .collect();
        let total: f64 = breadth.values().sum();
        let weights = breadth.into_iter().map(|(id, others)| {
            let weight = if total > 0.0 {
                others / total
            } else {
                1.0 / sample_size as f64
            };
            (id, weight)
        });

        BlastRadius {
            entity_ref: entity_ref.to_owned(),
            affected_entities,
            predicted_outcomes: self.outcome_distribution(
                trajectories.iter().map(|id| (id.as_str(), 1.0)),
            ),
            confidence: saturation(sample_size),
            sample_size,
            evidence: top_evidence(weights),
            version: VersionStamp::CURRENT,
        }
    }

    /// Known trajectories ranked by similarity to the given entities and
    /// step pattern.
    pub fn similar_trajectories<E, P>(&self, entity_refs: &[E], step_pattern: &[P]) -> SimilarTrajectories
    where
        E: AsRef<str>,
        P: AsRef<str>,
    {
        let matches = self.rank(entity_refs, step_pattern);
        let sample_size = matches.len();
        SimilarTrajectories {
            confidence: confidence_of(&matches),
            sample_size,
            evidence: top_evidence(
                matches
                    .iter()
                    .map(|m| (m.trajectory_id.as_str(), m.similarity)),
            ),
            matches,
            version: VersionStamp::CURRENT,
        }
    }

    /// Predict outcomes of a change touching `affected_entities` and
    /// executed as `step_pattern`.
    ///
    /// Outcomes of similar past trajectories are averaged, weighted by
    /// similarity. Risk factors name the requested entities with a history
    /// of non-success outcomes and the requested transitions that are rare
    /// or unseen in history, scaled to shares of their total.
    pub fn simulate_change<E, P>(&self, affected_entities: &[E], step_pattern: &[P]) -> ChangeSimulation
    where
        E: AsRef<str>,
        P: AsRef<str>,
    {
        let matches = self.rank(affected_entities, step_pattern);
        let predicted_outcomes = self.outcome_distribution(
            matches
                .iter()
                .map(|m| (m.trajectory_id.as_str(), m.similarity)),
        );

        let mut risk_factors = BTreeMap::new();
        for entity in affected_entities.iter().map(AsRef::as_ref) {
            let Some(trajectories) = self.co_occurrence.trajectories_with(entity) else {
                continue;
            };
            let dist = self.outcome_distribution(trajectories.iter().map(|id| (id.as_str(), 1.0)));
            let success = dist.get(SUCCESS_OUTCOME).copied().unwrap_or(0.0);
            if !dist.is_empty() && success < 1.0 {
                risk_factors.insert(format!("entity:{entity}"), 1.0 - success);
            }
        }
        let pattern: Vec<&str> = step_pattern.iter().map(AsRef::as_ref).collect();
        for pair in pattern.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if let Some(p) = self.transitions.probability(from, to)
                && p < 1.0
            {
                risk_factors.insert(format!("transition:{from}->{to}"), 1.0 - p);
            }
        }

        ChangeSimulation {
            predicted_outcomes,
            risk_factors: normalize(risk_factors),
            confidence: confidence_of(&matches),
            sample_size: matches.len(),
            evidence: top_evidence(
                matches
                    .iter()
                    .map(|m| (m.trajectory_id.as_str(), m.similarity)),
            ),
            version: VersionStamp::CURRENT,
        }
    }

    fn rank<E, P>(&self, entity_refs: &[E], step_pattern: &[P]) -> Vec<SimilarTrajectory>
    where
        E: AsRef<str>,
        P: AsRef<str>,
    {
        let wanted_entities: BTreeSet<&str> = entity_refs.iter().map(AsRef::as_ref).collect();
        let wanted_pattern: Vec<&str> = step_pattern.iter().map(AsRef::as_ref).collect();

        let mut matches: Vec<SimilarTrajectory> = self
            .signatures
            .signatures
            .iter()
            .filter_map(|(trajectory_id, signature)| {
                let entities: BTreeSet<&str> =
                    signature.entities.iter().map(String::as_str).collect();
                let entity_overlap = jaccard(&wanted_entities, &entities);
                let pattern_similarity = pattern_similarity(&wanted_pattern, &signature.pattern());
                let similarity = ENTITY_SIMILARITY_WEIGHT * entity_overlap
                    + (1.0 - ENTITY_SIMILARITY_WEIGHT) * pattern_similarity;
                (similarity > 0.0).then(|| SimilarTrajectory {
                    trajectory_id: trajectory_id.clone(),
                    similarity,
                    entity_overlap,
                    pattern_similarity,
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            by_score_desc(
                (a.similarity, a.trajectory_id.as_str()),
                (b.similarity, b.trajectory_id.as_str()),
            )
        });
        matches
    }

    /// Weighted mix of each trajectory's own outcome distribution.
    ///
    /// Trajectories without outcomes contribute nothing.
    fn outcome_distribution<'a>(
        &self,
        weighted: impl Iterator<Item = (&'a str, f64)>,
    ) -> BTreeMap<String, f64> {
        let mut mass: BTreeMap<String, f64> = BTreeMap::new();
        for (trajectory_id, weight) in weighted {
            let counts = self.outcomes.outcome_counts(trajectory_id);
            let total: u64 = counts.values().sum();
            if total == 0 {
                continue;
            }
            for (kind, n) in counts {
                *mass.entry(kind).or_default() += weight * n as f64 / total as f64;
            }
        }
        normalize(mass)
    }
}

/// Sample saturation scaled by mean similarity of the matches.
fn confidence_of(matches: &[SimilarTrajectory]) -> f64 {
    if matches.is_empty() {
        return 0.0;
    }
    let mean = matches.iter().map(|m| m.similarity).sum::<f64>() / matches.len() as f64;
    saturation(matches.len()) * mean
}

fn top_evidence<'a>(weights: impl Iterator<Item = (&'a str, f64)>) -> Vec<Evidence> {
    let mut evidence: Vec<(&str, f64)> = weights.collect();
    evidence.sort_by(|a, b| by_score_desc((a.1, a.0), (b.1, b.0)));
    evidence
        .into_iter()
        .take(MAX_EVIDENCE)
        .map(|(trajectory_id, weight)| Evidence {
            trajectory_id: trajectory_id.to_owned(),
            weight,
        })
        .collect()
}
