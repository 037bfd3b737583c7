//! Workspace aggregate -- tasks and field suggestions.
//!
//! Every task and suggestion lives in one aggregate whose state is folded
//! from the whole event log. Events carry the entity revision they produce,
//! so each logical transition has a distinct deterministic id while a
//! re-derived copy of the same transition collapses onto the stored one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::{Aggregate, Decision};
use crate::command::CommandContext;
use crate::domain::suggestion::{Suggestion, decide_proposal};
use crate::error::{LedgerError, Result};

/// Bucket assigned to tasks created without one.
pub const DEFAULT_BUCKET: &str = "today";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet done.
    #[default]
    Open,
    /// Marked done.
    Completed,
}

/// One task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub task_id: String,
    /// Optional title.
    pub title: Option<String>,
    /// Triage bucket (e.g. "today", "later").
    pub bucket: String,
    /// Current status.
    pub status: TaskStatus,
    /// Number of events applied to this task.
    pub revision: u64,
}

/// Folded workspace state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    /// Tasks by id.
    pub tasks: BTreeMap<String, Task>,
    /// Current suggestion per target reference.
    pub suggestions: BTreeMap<String, Suggestion>,
}

impl Workspace {
    fn task(&self, task_id: &str) -> Result<&Task> {
        self.tasks
            .get(task_id)
            .ok_or_else(|| LedgerError::precondition("exists", "missing"))
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands accepted by the [`Workspace`] aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkspaceCommand {
    /// Create a task; `bucket` defaults to [`DEFAULT_BUCKET`].
    #[serde(rename = "task.create")]
    CreateTask {
        task_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        bucket: Option<String>,
    },
    /// Mark a task done.
    #[serde(rename = "task.complete")]
    CompleteTask { task_id: String },
    /// Reopen a completed task.
    #[serde(rename = "task.reopen")]
    ReopenTask { task_id: String },
    /// Change a task's bucket and/or title.
    #[serde(rename = "task.triage")]
    TriageTask {
        task_id: String,
        #[serde(default)]
        bucket: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
    /// Propose a value for a target field.
    #[serde(rename = "suggestion.propose")]
    ProposeSuggestion {
        target_ref: String,
        value: Value,
        confidence: f64,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Domain events produced by the [`Workspace`] aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkspaceEvent {
    /// A task was created with status open.
    #[serde(rename = "task.created")]
    TaskCreated {
        task_id: String,
        title: Option<String>,
        bucket: String,
    },
    /// A task was marked done.
    #[serde(rename = "task.completed")]
    TaskCompleted { task_id: String, revision: u64 },
    /// A completed task was reopened.
    #[serde(rename = "task.reopened")]
    TaskReopened { task_id: String, revision: u64 },
    /// Only the changed fields are present.
    #[serde(rename = "task.triaged")]
    TaskTriaged {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bucket: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        revision: u64,
    },
    /// First suggestion for a target.
    #[serde(rename = "suggestion.proposed")]
    SuggestionProposed {
        target_ref: String,
        value: Value,
        confidence: f64,
        revision: u64,
    },
    /// A suggestion replaced a lower-confidence one.
    #[serde(rename = "suggestion.superseded")]
    SuggestionSuperseded {
        target_ref: String,
        value: Value,
        confidence: f64,
        prior_confidence: f64,
        revision: u64,
    },
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for Workspace {
    const AGGREGATE_TYPE: &'static str = "workspace";
    type Command = WorkspaceCommand;
    type DomainEvent = WorkspaceEvent;

    fn handle(&self, cmd: WorkspaceCommand, _ctx: &CommandContext) -> Result<Decision<WorkspaceEvent>> {
        match cmd {
            WorkspaceCommand::CreateTask {
                task_id,
                title,
                bucket,
            } => {
                require_id("task_id", &task_id)?;
                if self.tasks.contains_key(&task_id) {
                    return Err(LedgerError::precondition("missing", "exists"));
                }
                Ok(Decision::emit(WorkspaceEvent::TaskCreated {
                    task_id,
                    title,
                    bucket: bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_owned()),
                }))
            }
            WorkspaceCommand::CompleteTask { task_id } => {
                let task = self.task(&task_id)?;
                if task.status == TaskStatus::Completed {
                    return Ok(Decision::no_change("already_completed"));
                }
                Ok(Decision::emit(WorkspaceEvent::TaskCompleted {
                    revision: task.revision + 1,
                    task_id,
                }))
            }
            WorkspaceCommand::ReopenTask { task_id } => {
                let task = self.task(&task_id)?;
                if task.status == TaskStatus::Open {
                    return Ok(Decision::no_change("already_open"));
                }
                Ok(Decision::emit(WorkspaceEvent::TaskReopened {
                    revision: task.revision + 1,
                    task_id,
                }))
            }
            WorkspaceCommand::TriageTask {
                task_id,
                bucket,
                title,
            } => {
                let task = self.task(&task_id)?;
                let bucket = bucket.filter(|b| *b != task.bucket);
                let title = title.filter(|t| task.title.as_ref() != Some(t));
                if bucket.is_none() && title.is_none() {
                    return Ok(Decision::no_change("no_changed_fields"));
                }
                Ok(Decision::emit(WorkspaceEvent::TaskTriaged {
                    revision: task.revision + 1,
                    task_id,
                    bucket,
                    title,
                }))
            }
            WorkspaceCommand::ProposeSuggestion {
                target_ref,
                value,
                confidence,
            } => {
                require_id("target_ref", &target_ref)?;
                let current = self.suggestions.get(&target_ref);
                Ok(decide_proposal(current, target_ref, value, confidence))
            }
        }
    }

    fn apply(mut self, event: &WorkspaceEvent) -> Self {
        match event {
            WorkspaceEvent::TaskCreated {
                task_id,
                title,
                bucket,
            } => {
                self.tasks.insert(
                    task_id.clone(),
                    Task {
                        task_id: task_id.clone(),
                        title: title.clone(),
                        bucket: bucket.clone(),
                        status: TaskStatus::Open,
                        revision: 1,
                    },
                );
            }
            WorkspaceEvent::TaskCompleted { task_id, revision } => {
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Completed;
                    task.revision = *revision;
                }
            }
            WorkspaceEvent::TaskReopened { task_id, revision } => {
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Open;
                    task.revision = *revision;
                }
            }
            WorkspaceEvent::TaskTriaged {
                task_id,
                bucket,
                title,
                revision,
            } => {
                if let Some(task) = self.tasks.get_mut(task_id) {
                    if let Some(bucket) = bucket {
                        task.bucket = bucket.clone();
                    }
                    if let Some(title) = title {
                        task.title = Some(title.clone());
                    }
                    task.revision = *revision;
                }
            }
            WorkspaceEvent::SuggestionProposed {
                target_ref,
                value,
                confidence,
                revision,
            }
            | WorkspaceEvent::SuggestionSuperseded {
                target_ref,
                value,
                confidence,
                revision,
                ..
            } => {
                self.suggestions.insert(
                    target_ref.clone(),
                    Suggestion {
                        value: value.clone(),
                        confidence: *confidence,
                        revision: *revision,
                    },
                );
            }
        }
        self
    }
}

fn require_id(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
