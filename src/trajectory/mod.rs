//! Execution-run trajectories and their outcomes.
//!
//! Steps and outcomes are appended to two JSONL logs. A SQLite index,
//! rebuildable from the logs at any time, answers filtered listings and
//! points reads at exact byte ranges.

mod cursor;
mod index;
mod store;
mod types;

pub use cursor::{decode_cursor, encode_cursor};
pub use store::TrajectoryStore;
pub use types::{
    AttachesTo, MAX_STEP_SEQ, OutcomeFilter, OutcomeRecorded, SortOrder, TrajectoryFilter,
    TrajectoryPage, TrajectoryRecord, TrajectoryStep,
};
