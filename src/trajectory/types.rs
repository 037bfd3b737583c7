//! Records, filters and pages of the trajectory store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Largest accepted `step_seq`; the index stores it as a signed 64-bit
/// integer.
pub const MAX_STEP_SEQ: u64 = i64::MAX as u64;

/// One step of one execution run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    /// Run this step belongs to.
    pub trajectory_id: String,
    /// Position within the run; unique per `trajectory_id`.
    pub step_seq: u64,
    /// Unique step id.
    pub step_id: String,
    /// Kind of step (e.g. `"plan"`, `"tool_call"`).
    pub step_type: String,
    /// When the step happened.
    pub timestamp: DateTime<Utc>,
    /// Entities the step touched.
    #[serde(default)]
    pub entity_refs: Vec<String>,
    /// Command the step issued, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_command_id: Option<String>,
}

impl TrajectoryStep {
    pub(crate) fn validate(&self) -> Result<()> {
        require("trajectory_id", &self.trajectory_id)?;
        require("step_id", &self.step_id)?;
        require("step_type", &self.step_type)?;
        if self.step_seq > MAX_STEP_SEQ {
            return Err(LedgerError::validation(format!(
                "step_seq {} exceeds {MAX_STEP_SEQ}",
                self.step_seq
            )));
        }
        if self.entity_refs.iter().any(|r| r.trim().is_empty()) {
            return Err(LedgerError::validation("entity_refs must not contain empty refs"));
        }
        Ok(())
    }
}

/// What an outcome is attached to. At least one side must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachesTo {
    /// The trajectory the outcome belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory_id: Option<String>,
    /// The command the outcome belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

/// An observed result of a run or command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecorded {
    /// Unique outcome id.
    pub outcome_id: String,
    /// Link to a trajectory and/or command.
    pub attaches_to: AttachesTo,
    /// Outcome label (e.g. `"success"`, `"rollback"`).
    pub kind: String,
    /// When the outcome was observed.
    pub timestamp: DateTime<Utc>,
}

impl OutcomeRecorded {
    pub(crate) fn validate(&self) -> Result<()> {
        require("outcome_id", &self.outcome_id)?;
        require("kind", &self.kind)?;
        let AttachesTo {
            trajectory_id,
            command_id,
        } = &self.attaches_to;
        let attached = [trajectory_id, command_id]
            .into_iter()
            .flatten()
            .any(|id| !id.trim().is_empty());
        if !attached {
            return Err(LedgerError::validation(
                "outcome must attach to a trajectory_id or command_id",
            ));
        }
        Ok(())
    }
}

/// Either kind of trajectory-store record, in log order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TrajectoryRecord {
    /// A step.
    Step(TrajectoryStep),
    /// An outcome.
    Outcome(OutcomeRecorded),
}

/// Order of [`TrajectoryStore::list_trajectories`](crate::TrajectoryStore::list_trajectories) results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Earliest matching step first.
    #[default]
    TimeAsc,
    /// Latest matching step first.
    TimeDesc,
}

/// Conjunctive trajectory filter.
///
/// A trajectory matches when at least one of its steps satisfies every set
/// field. Time bounds are `since <= timestamp < until`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryFilter {
    /// The step touched this entity.
    #[serde(default)]
    pub entity_ref: Option<String>,
    /// The step issued this command.
    #[serde(default)]
    pub command_id: Option<String>,
    /// The step's type is one of these.
    #[serde(default)]
    pub step_types: Option<BTreeSet<String>>,
    /// Inclusive lower time bound.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper time bound.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl TrajectoryFilter {
    /// Match steps touching `entity_ref`.
    pub fn entity(mut self, entity_ref: impl Into<String>) -> Self {
        self.entity_ref = Some(entity_ref.into());
        self
    }

    /// Match steps that issued `command_id`.
    pub fn command(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    /// Match steps whose type is in `types`.
    pub fn step_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Match steps in `[since, until)`.
    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }
}

/// One page of trajectory ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryPage {
    /// Distinct trajectory ids, at most `limit`.
    pub trajectory_ids: Vec<String>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Outcome query. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeFilter {
    /// Attached to this command.
    #[serde(default)]
    pub command_id: Option<String>,
    /// Attached directly to this trajectory.
    #[serde(default)]
    pub trajectory_id: Option<String>,
    /// Of this kind.
    #[serde(default)]
    pub kind: Option<String>,
    /// Inclusive lower time bound.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper time bound.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> TrajectoryStep {
        TrajectoryStep {
            trajectory_id: "tr-1".into(),
            step_seq: 1,
            step_id: "s1".into(),
            step_type: "plan".into(),
            timestamp: Utc::now(),
            entity_refs: vec!["file:a".into()],
            related_command_id: None,
        }
    }

    #[test]
    fn step_requires_ids() {
        assert!(step().validate().is_ok());
        let mut bad = step();
        bad.step_type = String::new();
        assert!(matches!(bad.validate(), Err(LedgerError::Validation(_))));
        let mut bad = step();
        bad.entity_refs.push(" ".into());
        assert!(matches!(bad.validate(), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn step_seq_must_fit_the_index() {
        let mut edge = step();
        edge.step_seq = MAX_STEP_SEQ;
        assert!(edge.validate().is_ok());
        let mut bad = step();
        bad.step_seq = u64::MAX;
        assert!(matches!(bad.validate(), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn outcome_must_attach_somewhere() {
        let outcome = OutcomeRecorded {
            outcome_id: "o1".into(),
            attaches_to: AttachesTo::default(),
            kind: "success".into(),
            timestamp: Utc::now(),
        };
        assert!(matches!(outcome.validate(), Err(LedgerError::Validation(_))));

        let attached = OutcomeRecorded {
            attaches_to: AttachesTo {
                command_id: Some("c1".into()),
                ..AttachesTo::default()
            },
            ..outcome
        };
        assert!(attached.validate().is_ok());
    }

    #[test]
    fn record_is_internally_tagged() {
        let json = serde_json::to_value(TrajectoryRecord::Step(step())).expect("serialize");
        assert_eq!(json["record"], "step");
        assert_eq!(json["trajectory_id"], "tr-1");
    }
}
