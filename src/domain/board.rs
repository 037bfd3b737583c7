//! Task board projection: tasks grouped by bucket and status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::workspace::{TaskStatus, WorkspaceEvent};
use crate::event::EventEnvelope;
use crate::projection::{Freshness, ProjectionDefinition};

/// One task as shown on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCard {
    /// Task id.
    pub task_id: String,
    /// Title, if any.
    pub title: Option<String>,
    /// Current bucket.
    pub bucket: String,
    /// Current status.
    pub status: TaskStatus,
    /// `occurred_at` of the last event touching the task.
    pub updated_at: DateTime<Utc>,
}

/// Board state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBoardView {
    /// Cards by task id.
    pub tasks: BTreeMap<String, TaskCard>,
    /// Last folded event.
    pub freshness: Freshness,
}

impl TaskBoardView {
    /// Open tasks in `bucket`, ordered by task id.
    pub fn open_in(&self, bucket: &str) -> Vec<&TaskCard> {
        self.tasks
            .values()
            .filter(|c| c.bucket == bucket && c.status == TaskStatus::Open)
            .collect()
    }

    /// Count of tasks per `(bucket, status)`.
    pub fn counts(&self) -> BTreeMap<(String, TaskStatus), usize> {
        let mut counts = BTreeMap::new();
        for card in self.tasks.values() {
            *counts.entry((card.bucket.clone(), card.status)).or_default() += 1;
        }
        counts
    }
}

/// Folds workspace task events into a [`TaskBoardView`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskBoard;

impl ProjectionDefinition for TaskBoard {
    const NAME: &'static str = "task-board";
    const VERSION: u32 = 1;
    type Event = EventEnvelope;
    type State = TaskBoardView;

    fn init(&self) -> TaskBoardView {
        TaskBoardView::default()
    }

    fn apply(&self, mut state: TaskBoardView, envelope: &EventEnvelope) -> TaskBoardView {
        state.freshness = Freshness::of_event(envelope);
        let Some(event) = envelope.decode::<WorkspaceEvent>() else {
            return state;
        };
        let at = envelope.occurred_at;
        match event {
            WorkspaceEvent::TaskCreated {
                task_id,
                title,
                bucket,
            } => {
                state.tasks.insert(
                    task_id.clone(),
                    TaskCard {
                        task_id,
                        title,
                        bucket,
                        status: TaskStatus::Open,
                        updated_at: at,
                    },
                );
            }
            WorkspaceEvent::TaskCompleted { task_id, .. } => {
                if let Some(card) = state.tasks.get_mut(&task_id) {
                    card.status = TaskStatus::Completed;
                    card.updated_at = at;
                }
            }
            WorkspaceEvent::TaskReopened { task_id, .. } => {
                if let Some(card) = state.tasks.get_mut(&task_id) {
                    card.status = TaskStatus::Open;
                    card.updated_at = at;
                }
            }
            WorkspaceEvent::TaskTriaged {
                task_id,
                bucket,
                title,
                ..
            } => {
                if let Some(card) = state.tasks.get_mut(&task_id) {
                    if let Some(bucket) = bucket {
                        card.bucket = bucket;
                    }
                    if title.is_some() {
                        card.title = title;
                    }
                    card.updated_at = at;
                }
            }
            WorkspaceEvent::SuggestionProposed { .. } | WorkspaceEvent::SuggestionSuperseded { .. } => {}
        }
        state
    }

    fn freshness(&self, state: &TaskBoardView) -> Freshness {
        state.freshness.clone()
    }
}
