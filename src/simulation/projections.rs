//! The four trajectory projections the simulation engine is built from.
//!
//! Each is an ordinary [`ProjectionDefinition`] over [`TrajectoryRecord`]s.
//! Steps may arrive in any `step_seq` order, so per-trajectory sequences are
//! kept keyed by `step_seq` and derived statistics are computed on read.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::projection::{Freshness, ProjectionDefinition};
use crate::trajectory::{OutcomeRecorded, TrajectoryRecord, TrajectoryStep};

fn observe(freshness: &mut Freshness, record: &TrajectoryRecord) {
    match record {
        TrajectoryRecord::Step(step) => freshness.observe(&step.step_id, step.timestamp),
        TrajectoryRecord::Outcome(outcome) => {
            freshness.observe(&outcome.outcome_id, outcome.timestamp)
        }
    }
}

// ----- Co-occurrence -----

/// Which entities appear together in trajectories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoOccurrenceView {
    /// Entities touched by each trajectory.
    pub entities_by_trajectory: BTreeMap<String, BTreeSet<String>>,
    /// Trajectories touching each entity.
    pub trajectories_by_entity: BTreeMap<String, BTreeSet<String>>,
    /// Last folded record.
    pub freshness: Freshness,
}

impl CoOccurrenceView {
    /// Trajectories that touched `entity_ref`.
    pub fn trajectories_with(&self, entity_ref: &str) -> Option<&BTreeSet<String>> {
        self.trajectories_by_entity.get(entity_ref)
    }

    /// For every other entity, the number of trajectories it shares with
    /// `entity_ref`.
    pub fn co_occurrences(&self, entity_ref: &str) -> BTreeMap<String, usize> {
        let mut shared = BTreeMap::new();
        let Some(trajectories) = self.trajectories_with(entity_ref) else {
            return shared;
        };
        for trajectory_id in trajectories {
            let Some(entities) = self.entities_by_trajectory.get(trajectory_id) else {
                continue;
            };
            for entity in entities.iter().filter(|e| e.as_str() != entity_ref) {
                *shared.entry(entity.clone()).or_default() += 1;
            }
        }
        shared
    }
}

/// Folds step entity refs into a [`CoOccurrenceView`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CoOccurrence;

impl ProjectionDefinition for CoOccurrence {
    const NAME: &'static str = "co-occurrence";
    const VERSION: u32 = 1;
    type Event = TrajectoryRecord;
    type State = CoOccurrenceView;

    fn init(&self) -> CoOccurrenceView {
        CoOccurrenceView::default()
    }

    fn apply(&self, mut state: CoOccurrenceView, record: &TrajectoryRecord) -> CoOccurrenceView {
        observe(&mut state.freshness, record);
        let TrajectoryRecord::Step(step) = record else {
            return state;
        };
        let entities = state
            .entities_by_trajectory
            .entry(step.trajectory_id.clone())
            .or_default();
        for entity in &step.entity_refs {
            entities.insert(entity.clone());
            state
                .trajectories_by_entity
                .entry(entity.clone())
                .or_default()
                .insert(step.trajectory_id.clone());
        }
        state
    }

    fn freshness(&self, state: &CoOccurrenceView) -> Freshness {
        state.freshness.clone()
    }
}

// ----- Transitions -----

/// Step-type sequences, from which transition statistics are derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionView {
    /// `step_seq -> step_type` per trajectory.
    pub sequences: BTreeMap<String, BTreeMap<u64, String>>,
    /// Last folded record.
    pub freshness: Freshness,
}

impl TransitionView {
    /// Count every adjacent `(from, to)` step-type pair across trajectories.
    pub fn table(&self) -> TransitionTable {
        let mut counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for sequence in self.sequences.values() {
            let types: Vec<&String> = sequence.values().collect();
            for pair in types.windows(2) {
                *counts
                    .entry(pair[0].clone())
                    .or_default()
                    .entry(pair[1].clone())
                    .or_default() += 1;
            }
        }
        TransitionTable { counts }
    }
}

/// Adjacent step-type pair counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionTable {
    /// `from -> to -> count`.
    pub counts: BTreeMap<String, BTreeMap<String, u64>>,
}

impl TransitionTable {
    /// Observed `P(to | from)`, or `None` if `from` was never followed by
    /// another step.
    pub fn probability(&self, from: &str, to: &str) -> Option<f64> {
        let next = self.counts.get(from)?;
        let total: u64 = next.values().sum();
        if total == 0 {
            return None;
        }
        let hits = next.get(to).copied().unwrap_or(0);
        Some(hits as f64 / total as f64)
    }
}

/// Folds step types into a [`TransitionView`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Transition;

impl ProjectionDefinition for Transition {
    const NAME: &'static str = "transition";
    const VERSION: u32 = 1;
    type Event = TrajectoryRecord;
    type State = TransitionView;

    fn init(&self) -> TransitionView {
        TransitionView::default()
    }

    fn apply(&self, mut state: TransitionView, record: &TrajectoryRecord) -> TransitionView {
        observe(&mut state.freshness, record);
        if let TrajectoryRecord::Step(step) = record {
            state
                .sequences
                .entry(step.trajectory_id.clone())
                .or_default()
                .entry(step.step_seq)
                .or_insert_with(|| step.step_type.clone());
        }
        state
    }

    fn freshness(&self, state: &TransitionView) -> Freshness {
        state.freshness.clone()
    }
}

// ----- Signatures -----

/// The shape of one trajectory: what it touched and the order of its steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectorySignature {
    /// Every entity any step touched.
    pub entities: BTreeSet<String>,
    /// `step_seq -> step_type`.
    pub steps: BTreeMap<u64, String>,
}

impl TrajectorySignature {
    /// Step types in `step_seq` order.
    pub fn pattern(&self) -> Vec<&str> {
        self.steps.values().map(String::as_str).collect()
    }

    /// Step types joined with `>`, e.g. `plan>edit>test`.
    pub fn fingerprint(&self) -> String {
        self.pattern().join(">")
    }

    fn add(&mut self, step: &TrajectoryStep) {
        self.entities.extend(step.entity_refs.iter().cloned());
        self.steps
            .entry(step.step_seq)
            .or_insert_with(|| step.step_type.clone());
    }
}

/// Signatures of every trajectory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureView {
    /// Signature per trajectory id.
    pub signatures: BTreeMap<String, TrajectorySignature>,
    /// Last folded record.
    pub freshness: Freshness,
}

/// Folds steps into a [`SignatureView`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Signature;

impl ProjectionDefinition for Signature {
    const NAME: &'static str = "signature";
    const VERSION: u32 = 1;
    type Event = TrajectoryRecord;
    type State = SignatureView;

    fn init(&self) -> SignatureView {
        SignatureView::default()
    }

    fn apply(&self, mut state: SignatureView, record: &TrajectoryRecord) -> SignatureView {
        observe(&mut state.freshness, record);
        if let TrajectoryRecord::Step(step) = record {
            state
                .signatures
                .entry(step.trajectory_id.clone())
                .or_default()
                .add(step);
        }
        state
    }

    fn freshness(&self, state: &SignatureView) -> Freshness {
        state.freshness.clone()
    }
}

// ----- Outcome correlation -----

/// Outcomes attached to trajectories, directly or via the commands their
/// steps issued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCorrelationView {
    /// Commands issued by each trajectory's steps.
    pub trajectory_commands: BTreeMap<String, BTreeSet<String>>,
    /// `outcome_id -> kind` attached directly to each trajectory.
    pub by_trajectory: BTreeMap<String, BTreeMap<String, String>>,
    /// `outcome_id -> kind` attached to each command.
    pub by_command: BTreeMap<String, BTreeMap<String, String>>,
    /// Last folded record.
    pub freshness: Freshness,
}

impl OutcomeCorrelationView {
    /// Outcome kind counts for one trajectory, each outcome counted once
    /// even if attached through several paths.
    pub fn outcome_counts(&self, trajectory_id: &str) -> BTreeMap<String, u64> {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        if let Some(direct) = self.by_trajectory.get(trajectory_id) {
            seen.extend(direct.iter().map(|(id, kind)| (id.as_str(), kind.as_str())));
        }
        for command_id in self.trajectory_commands.get(trajectory_id).into_iter().flatten() {
            if let Some(outcomes) = self.by_command.get(command_id) {
                seen.extend(outcomes.iter().map(|(id, kind)| (id.as_str(), kind.as_str())));
            }
        }
        let mut counts = BTreeMap::new();
        for kind in seen.into_values() {
            *counts.entry(kind.to_owned()).or_default() += 1;
        }
        counts
    }

    /// Outcome kind counts per signature fingerprint.
    pub fn by_signature(&self, signatures: &SignatureView) -> BTreeMap<String, BTreeMap<String, u64>> {
        let mut out: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for (trajectory_id, signature) in &signatures.signatures {
            let counts = self.outcome_counts(trajectory_id);
            if counts.is_empty() {
                continue;
            }
            let entry = out.entry(signature.fingerprint()).or_default();
            for (kind, n) in counts {
                *entry.entry(kind).or_default() += n;
            }
        }
        out
    }

    fn attach(&mut self, outcome: &OutcomeRecorded) {
        let record = (outcome.outcome_id.clone(), outcome.kind.clone());
        if let Some(trajectory_id) = &outcome.attaches_to.trajectory_id {
            self.by_trajectory
                .entry(trajectory_id.clone())
                .or_default()
                .entry(record.0.clone())
                .or_insert_with(|| record.1.clone());
        }
        if let Some(command_id) = &outcome.attaches_to.command_id {
            self.by_command
                .entry(command_id.clone())
                .or_default()
                .entry(record.0)
                .or_insert(record.1);
        }
    }
}

/// Folds steps and outcomes into an [`OutcomeCorrelationView`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeCorrelation;

impl ProjectionDefinition for OutcomeCorrelation {
    const NAME: &'static str = "outcome-correlation";
    const VERSION: u32 = 1;
    type Event = TrajectoryRecord;
    type State = OutcomeCorrelationView;

    fn init(&self) -> OutcomeCorrelationView {
        OutcomeCorrelationView::default()
    }

    fn apply(
        &self,
        mut state: OutcomeCorrelationView,
        record: &TrajectoryRecord,
    ) -> OutcomeCorrelationView {
        observe(&mut state.freshness, record);
        match record {
            TrajectoryRecord::Step(step) => {
                if let Some(command_id) = &step.related_command_id {
                    state
                        .trajectory_commands
                        .entry(step.trajectory_id.clone())
                        .or_default()
                        .insert(command_id.clone());
                }
            }
            TrajectoryRecord::Outcome(outcome) => state.attach(outcome),
        }
        state
    }

    fn freshness(&self, state: &OutcomeCorrelationView) -> Freshness {
        state.freshness.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::AttachesTo;
    use chrono::{TimeZone, Utc};

    fn step(tr: &str, seq: u64, ty: &str, entities: &[&str], cmd: Option<&str>) -> TrajectoryRecord {
        TrajectoryRecord::Step(TrajectoryStep {
            trajectory_id: tr.into(),
            step_seq: seq,
            step_id: format!("{tr}-{seq}"),
            step_type: ty.into(),
            timestamp: Utc.timestamp_opt(seq as i64, 0).single().expect("valid timestamp"),
            entity_refs: entities.iter().map(|e| e.to_string()).collect(),
            related_command_id: cmd.map(Into::into),
        })
    }

    fn outcome(id: &str, tr: Option<&str>, cmd: Option<&str>, kind: &str) -> TrajectoryRecord {
        TrajectoryRecord::Outcome(OutcomeRecorded {
            outcome_id: id.into(),
            attaches_to: AttachesTo {
                trajectory_id: tr.map(Into::into),
                command_id: cmd.map(Into::into),
            },
            kind: kind.into(),
            timestamp: Utc.timestamp_opt(100, 0).single().expect("valid timestamp"),
        })
    }

    fn fold<D: ProjectionDefinition<Event = TrajectoryRecord>>(
        def: D,
        records: &[TrajectoryRecord],
    ) -> D::State {
        records.iter().fold(def.init(), |s, r| def.apply(s, r))
    }

    #[test]
    fn co_occurrence_counts_shared_trajectories() {
        let view = fold(
            CoOccurrence,
            &[
                step("t1", 1, "edit", &["a", "b"], None),
                step("t2", 1, "edit", &["a"], None),
                step("t2", 2, "edit", &["b", "c"], None),
                step("t3", 1, "edit", &["c"], None),
            ],
        );
        let shared = view.co_occurrences("a");
        assert_eq!(shared.get("b"), Some(&2));
        assert_eq!(shared.get("c"), Some(&1));
        assert!(!shared.contains_key("a"));
        assert!(view.co_occurrences("zzz").is_empty());
    }

    #[test]
    fn transitions_follow_step_seq_not_arrival_order() {
        let view = fold(
            Transition,
            &[
                step("t1", 2, "edit", &[], None),
                step("t1", 1, "plan", &[], None),
                step("t1", 3, "test", &[], None),
                step("t2", 1, "plan", &[], None),
                step("t2", 2, "test", &[], None),
            ],
        );
        let table = view.table();
        assert_eq!(table.probability("plan", "edit"), Some(0.5));
        assert_eq!(table.probability("plan", "test"), Some(0.5));
        assert_eq!(table.probability("edit", "test"), Some(1.0));
        assert_eq!(table.probability("test", "plan"), None);
    }

    #[test]
    fn signature_fingerprint_is_ordered_pattern() {
        let view = fold(
            Signature,
            &[
                step("t1", 3, "test", &["x"], None),
                step("t1", 1, "plan", &["y"], None),
                step("t1", 2, "edit", &["x"], None),
            ],
        );
        let sig = &view.signatures["t1"];
        assert_eq!(sig.fingerprint(), "plan>edit>test");
        assert_eq!(sig.entities.len(), 2);
    }

    #[test]
    fn outcomes_attach_directly_and_through_commands_once() {
        let records = [
            step("t1", 1, "plan", &[], Some("c1")),
            outcome("o1", Some("t1"), Some("c1"), "success"),
            outcome("o2", None, Some("c1"), "rollback"),
            outcome("o3", Some("t2"), None, "success"),
        ];
        let view = fold(OutcomeCorrelation, &records);
        let counts = view.outcome_counts("t1");
        assert_eq!(counts.get("success"), Some(&1));
        assert_eq!(counts.get("rollback"), Some(&1));

        let sigs = fold(Signature, &records);
        let by_sig = view.by_signature(&sigs);
        assert_eq!(by_sig["plan"]["success"], 1);
    }
}
