//! Event-sourced command ledger with exactly-once command handling,
//! deterministic projection rebuilds and a trajectory store with
//! similarity-based impact analysis.
//!
//! Every durable structure is an append-only JSON-lines log under one data
//! directory, opened through a [`LedgerStore`]:
//!
//! - [`EventStore`] holds domain events keyed by a content-derived
//!   [`derive_event_id`], so re-appending the same event is a no-op.
//! - [`CommandLog`] records attempts and final outcomes, keyed by
//!   `command_id` and by scoped idempotency key.
//! - [`CommandLedger`] executes typed commands against an [`Aggregate`]
//!   folded from the event log.
//! - [`rebuild_one`] folds any [`EventSource`] through a
//!   [`ProjectionDefinition`].
//! - [`TrajectoryStore`] keeps execution-run steps and outcomes with a
//!   rebuildable SQLite index, and [`SimulationEngine`] answers
//!   blast-radius and what-if queries over them.
//!
//! ```
//! use ledgerfold::{CommandEnvelope, DedupeScope, derive_event_id};
//! use serde_json::json;
//!
//! let cmd = CommandEnvelope::new("cmd-1", "task.create", json!({"task_id": "T1"}))
//!     .with_target_ref("task:T1")
//!     .with_dedupe_scope(DedupeScope::Target);
//! assert_eq!(cmd.scope_key(), "target:task:T1");
//!
//! let a = derive_event_id("task.created", &json!({"task_id": "T1"}));
//! let b = derive_event_id("task.created", &json!({"task_id": "T1"}));
//! assert_eq!(a, b);
//! ```

mod aggregate;
pub use aggregate::{Aggregate, Decision, reduce};
mod command;
mod command_log;
pub mod domain;
mod error;
mod event;
mod event_store;
mod ledger;
mod merge;
mod projection;
pub mod simulation;
mod snapshot;
mod storage;
mod store;
pub mod trajectory;

pub use command::{CommandContext, CommandEnvelope, CommandOutcome, DedupeScope, OutcomeStatus};
pub use command_log::{AttemptRecord, AttemptStatus, CommandLog, DEFAULT_PENDING_TIMEOUT, StartStatus};
pub use error::{LedgerError, Result};
pub use event::{
    DEFAULT_PAYLOAD_SCHEMA_VERSION, ENVELOPE_VERSION, EventEnvelope, decode_tagged,
    derive_event_id, encode_domain_event, encode_tagged,
};
pub use event_store::{AppendResult, EventStore};
pub use ledger::{CommandLedger, NO_CHANGE_REASON};
pub use merge::{Candidate, Merged, resolve};
pub use projection::{EventSource, Freshness, Projection, ProjectionCache, ProjectionDefinition, rebuild_one};
pub use simulation::SimulationEngine;
pub use snapshot::{ReplayStrategy, Snapshot, load_snapshot, replay, replay_full, save_snapshot};
pub use storage::{DataLayout, RecordPos, SourceProbe};
pub use store::{DEFAULT_FSYNC, LedgerConfig, LedgerStore, LedgerStoreBuilder};
pub use trajectory::TrajectoryStore;
