//! Top-level entry point that opens every log under one directory and hands
//! out typed [`CommandLedger`]s, projection rebuilds and the trajectory
//! store from a single [`LedgerStore`] handle.
//!
//! The store is opened via [`LedgerStoreBuilder`]. Nothing in the crate
//! keeps global state: construct one store per data directory and pass it
//! (or clones of it) wherever commands are executed or views are read.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::aggregate::Aggregate;
use crate::command::{CommandEnvelope, CommandOutcome};
use crate::command_log::{CommandLog, DEFAULT_PENDING_TIMEOUT};
use crate::error::Result;
use crate::event::EventEnvelope;
use crate::event_store::EventStore;
use crate::ledger::CommandLedger;
use crate::projection::{Projection, ProjectionDefinition, rebuild_one};
use crate::simulation::SimulationEngine;
use crate::snapshot::ReplayStrategy;
use crate::storage::DataLayout;
use crate::trajectory::TrajectoryStore;

/// Type-erased ledger cache keyed by aggregate type.
///
/// `Box<dyn Any + Send + Sync>` lets one map hold `CommandLedger<A>` for
/// any concrete `A`; downcasting recovers the typed ledger.
type LedgerCache = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// Default for [`LedgerStoreBuilder::fsync`].
pub const DEFAULT_FSYNC: bool = true;

/// Central handle over one data directory.
///
/// Owns the event store, command log and trajectory store, and caches one
/// [`CommandLedger`] per aggregate type so every caller of
/// [`ledger`](LedgerStore::ledger) shares that type's write gate.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct LedgerStore {
    layout: DataLayout,
    events: Arc<EventStore>,
    commands: Arc<CommandLog>,
    trajectories: Arc<TrajectoryStore>,
    ledgers: Arc<RwLock<LedgerCache>>,
    replay_strategy: ReplayStrategy,
}

// Manual `Debug` because `dyn Any` is not `Debug`.
impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore")
            .field("base_dir", &self.layout.base_dir())
            .field("replay_strategy", &self.replay_strategy)
            .finish_non_exhaustive()
    }
}

impl LedgerStore {
    /// Start configuring a store rooted at `base_dir`.
    pub fn builder(base_dir: impl Into<PathBuf>) -> LedgerStoreBuilder {
        LedgerStoreBuilder::new(base_dir)
    }

    /// Open a store at `base_dir` with default settings.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(base_dir).open().await
    }

    /// Directory layout of this store.
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// The shared event store.
    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    /// The shared command log.
    pub fn commands(&self) -> &Arc<CommandLog> {
        &self.commands
    }

    /// The trajectory store.
    pub fn trajectories(&self) -> &Arc<TrajectoryStore> {
        &self.trajectories
    }

    /// The ledger for aggregate type `A`, created on first use.
    ///
    /// Snapshots for `A` (under [`ReplayStrategy::Snapshot`]) live at
    /// [`DataLayout::snapshot_file`] named after `A::AGGREGATE_TYPE`.
    pub async fn ledger<A: Aggregate>(&self) -> CommandLedger<A> {
        let key = TypeId::of::<A>();

        // Fast path: check cache with read lock.
        {
            let cache = self.ledgers.read().await;
            if let Some(ledger) = cache
                .get(&key)
                .and_then(|boxed| boxed.downcast_ref::<CommandLedger<A>>())
            {
                return ledger.clone();
            }
        }

        let mut cache = self.ledgers.write().await;
        if let Some(ledger) = cache
            .get(&key)
            .and_then(|boxed| boxed.downcast_ref::<CommandLedger<A>>())
        {
            return ledger.clone();
        }
        tracing::debug!(aggregate_type = A::AGGREGATE_TYPE, "creating ledger");
        let ledger = CommandLedger::<A>::new(
            Arc::clone(&self.events),
            Arc::clone(&self.commands),
            self.replay_strategy,
            self.layout.snapshot_file(A::AGGREGATE_TYPE),
        );
        cache.insert(key, Box::new(ledger.clone()));
        ledger
    }

    /// Execute `envelope` against aggregate type `A`.
    ///
    /// Shorthand for `store.ledger::<A>().await.execute(envelope)`.
    pub async fn execute<A: Aggregate>(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome> {
        self.ledger::<A>().await.execute(envelope).await
    }

    /// Rebuild an event-log projection from scratch.
    pub async fn projection<D>(&self, def: &D) -> Result<Projection<D::State>>
    where
        D: ProjectionDefinition<Event = EventEnvelope>,
    {
        rebuild_one(def, self.events.as_ref()).await
    }

    /// Build a [`SimulationEngine`] from the current trajectory history.
    pub async fn simulation(&self) -> Result<SimulationEngine> {
        SimulationEngine::build(self.trajectories.as_ref()).await
    }
}

/// Serializable settings mirroring [`LedgerStoreBuilder`].
///
/// Every field has a default, so `{}` is a valid configuration.
///
/// # Examples
///
/// ```
/// use ledgerfold::{LedgerConfig, ReplayStrategy};
///
/// let config = LedgerConfig::from_json(r#"{"replay_strategy": {"mode": "snapshot", "every": 100}}"#)
///     .expect("config should parse");
/// assert_eq!(config.replay_strategy, ReplayStrategy::Snapshot { every: 100 });
/// assert!(config.fsync);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// How ledgers rebuild aggregate state.
    pub replay_strategy: ReplayStrategy,
    /// Seconds after which a pending command attempt counts as abandoned.
    pub pending_timeout_secs: u64,
    /// Whether appends are followed by `sync_data`.
    pub fsync: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            replay_strategy: ReplayStrategy::default(),
            pending_timeout_secs: DEFAULT_PENDING_TIMEOUT.as_secs(),
            fsync: DEFAULT_FSYNC,
        }
    }
}

impl LedgerConfig {
    /// Parse a configuration from JSON.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Serialization`](crate::LedgerError::Serialization) on
    /// malformed JSON or unknown fields.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Builder for configuring and opening a [`LedgerStore`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use ledgerfold::{LedgerStore, ReplayStrategy};
///
/// # async fn example() -> ledgerfold::Result<()> {
/// let store = LedgerStore::builder("/var/lib/my-app")
///     .replay_strategy(ReplayStrategy::Snapshot { every: 500 })
///     .pending_timeout(Duration::from_secs(60))
///     .open()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LedgerStoreBuilder {
    base_dir: PathBuf,
    replay_strategy: ReplayStrategy,
    pending_timeout: Duration,
    fsync: bool,
}

impl LedgerStoreBuilder {
    /// Create a builder with default settings rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            replay_strategy: ReplayStrategy::default(),
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            fsync: DEFAULT_FSYNC,
        }
    }

    /// Apply every setting from `config`.
    pub fn config(self, config: &LedgerConfig) -> Self {
        self.replay_strategy(config.replay_strategy)
            .pending_timeout(Duration::from_secs(config.pending_timeout_secs))
            .fsync(config.fsync)
    }

    /// Set how ledgers rebuild aggregate state. Defaults to
    /// [`ReplayStrategy::Full`].
    pub fn replay_strategy(mut self, strategy: ReplayStrategy) -> Self {
        self.replay_strategy = strategy;
        self
    }

    /// Set the age after which a pending command attempt is treated as
    /// abandoned and may be restarted.
    ///
    /// Defaults to 5 minutes.
    pub fn pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Set whether every append is followed by `sync_data`. Defaults to
    /// `true`; tests usually turn it off.
    pub fn fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    /// Open every log, rebuild in-memory indexes and sync the trajectory
    /// index.
    ///
    /// # Errors
    ///
    /// Store-level errors from opening or replaying any log.
    pub async fn open(self) -> Result<LedgerStore> {
        let layout = DataLayout::new(self.base_dir);
        let events = EventStore::open(layout.events_log(), self.fsync).await?;
        let commands = CommandLog::open(
            layout.attempts_log(),
            layout.command_outcomes_log(),
            self.fsync,
        )
        .await?
        .with_pending_timeout(self.pending_timeout);
        let trajectories = TrajectoryStore::open(&layout, self.fsync).await?;

        tracing::info!(
            base_dir = %layout.base_dir().display(),
            replay_strategy = ?self.replay_strategy,
            "ledger store opened"
        );

        Ok(LedgerStore {
            layout,
            events: Arc::new(events),
            commands: Arc::new(commands),
            trajectories: Arc::new(trajectories),
            ledgers: Arc::new(RwLock::new(HashMap::new())),
            replay_strategy: self.replay_strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::OutcomeStatus;
    use crate::domain::{TaskBoard, TaskStatus, Workspace, WorkspaceCommand};
    use crate::trajectory::TrajectoryStep;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> LedgerStore {
        LedgerStore::builder(tmp.path())
            .fsync(false)
            .open()
            .await
            .expect("open should succeed")
    }

    #[test]
    fn config_defaults_match_builder_defaults() {
        let config = LedgerConfig::from_json("{}").expect("empty config should parse");
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.pending_timeout_secs, 300);
        assert!(config.fsync);
        assert!(LedgerConfig::from_json(r#"{"fsnyc": false}"#).is_err());
    }

    #[tokio::test]
    async fn ledgers_are_cached_per_aggregate_type() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = open(&tmp).await;
        let a = store.ledger::<Workspace>().await;
        let b = store.ledger::<Workspace>().await;
        assert!(Arc::ptr_eq(a.events(), b.events()));
        assert!(Arc::ptr_eq(a.events(), store.events()));
        assert_eq!(store.ledgers.read().await.len(), 1);
    }

    #[tokio::test]
    async fn commands_and_projections_share_the_event_log() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = open(&tmp).await;
        let create = CommandEnvelope::from_command(
            "cmd-1",
            &WorkspaceCommand::CreateTask {
                task_id: "T1".into(),
                title: Some("Write report".into()),
                bucket: None,
            },
        )
        .expect("envelope should encode")
        .with_target_ref("task:T1");

        let outcome = store
            .execute::<Workspace>(&create)
            .await
            .expect("execute should succeed");
        assert_eq!(outcome.status, OutcomeStatus::Accepted);

        let board = store
            .projection(&TaskBoard)
            .await
            .expect("rebuild should succeed");
        let card = &board.data.tasks["T1"];
        assert_eq!(card.status, TaskStatus::Open);
        assert_eq!(card.bucket, "today");
    }

    #[tokio::test]
    async fn reopened_store_sees_previous_state() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        {
            let store = open(&tmp).await;
            let create = CommandEnvelope::from_command(
                "cmd-1",
                &WorkspaceCommand::CreateTask {
                    task_id: "T1".into(),
                    title: None,
                    bucket: Some("later".into()),
                },
            )
            .expect("envelope should encode");
            store
                .execute::<Workspace>(&create)
                .await
                .expect("execute should succeed");
            store
                .trajectories()
                .append_step(&TrajectoryStep {
                    trajectory_id: "tr-1".into(),
                    step_seq: 1,
                    step_id: "s1".into(),
                    step_type: "plan".into(),
                    timestamp: Utc::now(),
                    entity_refs: vec!["task:T1".into()],
                    related_command_id: Some("cmd-1".into()),
                })
                .await
                .expect("append should succeed");
        }

        let store = open(&tmp).await;
        let state = store
            .ledger::<Workspace>()
            .await
            .state()
            .await
            .expect("state should rebuild");
        assert_eq!(state.tasks["T1"].bucket, "later");
        assert!(store.commands().get_by_idempotency_key("cmd-1").await.is_some());

        let sim = store.simulation().await.expect("engine should build");
        assert_eq!(sim.blast_radius("task:T1").sample_size, 1);
    }
}
