//! Workspace domain: a task/suggestion aggregate and two read models.

mod board;
mod contacts;
mod suggestion;
mod workspace;

pub use board::{TaskBoard, TaskBoardView, TaskCard};
pub use contacts::{
    CONTACT_OBSERVED, ContactDirectory, ContactDirectoryView, ContactObserved, ContactRole,
    ContactView,
};
pub use suggestion::{SUPERSEDE_MIN_CONFIDENCE_GAIN, Suggestion, decide_proposal};
pub use workspace::{
    DEFAULT_BUCKET, Task, TaskStatus, Workspace, WorkspaceCommand, WorkspaceEvent,
};
