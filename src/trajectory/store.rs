//! Trajectory persistence: two append logs plus the SQLite index over them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{LedgerError, Result};
use crate::projection::EventSource;
use crate::storage::{AppendLog, DataLayout, RecordPos, SourceProbe, read_record};
use crate::trajectory::cursor::{decode_cursor, encode_cursor};
use crate::trajectory::index::{LogKind, TrajectoryIndex};
use crate::trajectory::types::{
    OutcomeFilter, OutcomeRecorded, SortOrder, TrajectoryFilter, TrajectoryPage, TrajectoryRecord,
    TrajectoryStep,
};

/// Records indexed per SQLite transaction during catch-up and rebuild.
const INDEX_BATCH: usize = 512;

/// Append-only store of trajectory steps and outcomes.
///
/// The two JSONL logs are the source of truth. The SQLite index maps ids,
/// filters and sort keys to exact byte ranges in the logs; it is brought up
/// to date on [`open`](TrajectoryStore::open) and can be thrown away and
/// rebuilt at any time with [`rebuild_index`](TrajectoryStore::rebuild_index).
///
/// Appends are serialised by a write gate so the duplicate check, the log
/// write and the index insert happen as one step. Index queries run on the
/// blocking pool.
pub struct TrajectoryStore {
    steps: AppendLog,
    outcomes: AppendLog,
    index: Arc<StdMutex<TrajectoryIndex>>,
    write_gate: Mutex<()>,
    /// Set when a record reached a log but not the index.
    stale: AtomicBool,
}

impl std::fmt::Debug for TrajectoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrajectoryStore")
            .field("steps", &self.steps)
            .field("outcomes", &self.outcomes)
            .field("stale", &self.stale.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TrajectoryStore {
    /// Open (or create) the store under `layout` and sync its index.
    ///
    /// If the logs hold records the index has not seen (a crash between log
    /// write and index insert, or a deleted index file) only the missing
    /// tail is indexed. If the index claims more than the logs hold it is
    /// rebuilt from scratch.
    pub async fn open(layout: &DataLayout, fsync: bool) -> Result<Self> {
        let steps = AppendLog::open(layout.steps_log(), fsync).await?;
        let outcomes = AppendLog::open(layout.trajectory_outcomes_log(), fsync).await?;
        let index_path = layout.trajectory_index();
        let index = tokio::task::spawn_blocking(move || TrajectoryIndex::open(&index_path)).await??;

        let store = Self {
            steps,
            outcomes,
            index: Arc::new(StdMutex::new(index)),
            write_gate: Mutex::new(()),
            stale: AtomicBool::new(false),
        };
        {
            let gate = store.write_gate.lock().await;
            store.sync_index(&gate).await?;
        }
        Ok(store)
    }

    /// Append one step.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Validation`] if a required field is empty, `step_seq`
    /// exceeds [`MAX_STEP_SEQ`](crate::trajectory::MAX_STEP_SEQ), or the
    /// `(trajectory_id, step_seq)` pair is already recorded.
    pub async fn append_step(&self, step: &TrajectoryStep) -> Result<()> {
        step.validate()?;
        let gate = self.write_gate.lock().await;
        self.ensure_fresh(&gate).await?;

        let (trajectory_id, step_seq) = (step.trajectory_id.clone(), step.step_seq);
        if self
            .with_index(move |ix| ix.step_exists(&trajectory_id, step_seq))
            .await?
        {
            return Err(LedgerError::validation(format!(
                "step {} of trajectory {} already recorded",
                step.step_seq, step.trajectory_id
            )));
        }

        let pos = self.steps.append(step).await?;
        let record = step.clone();
        if let Err(err) = self
            .with_index(move |ix| ix.insert_steps(&[(pos, record)]))
            .await
        {
            self.mark_stale(&err);
        }
        tracing::debug!(
            trajectory_id = %step.trajectory_id,
            step_seq = step.step_seq,
            step_type = %step.step_type,
            "step appended"
        );
        Ok(())
    }

    /// All steps of a trajectory, ordered by `step_seq`.
    ///
    /// Each step is read by seeking to its indexed byte range. An unknown
    /// id yields an empty vector.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Corrupt`] if an indexed range does not hold the step
    /// the index says it does.
    pub async fn read_trajectory(&self, trajectory_id: &str) -> Result<Vec<TrajectoryStep>> {
        self.refresh_if_stale().await?;
        let id = trajectory_id.to_owned();
        let positions = self.with_index(move |ix| ix.step_positions(&id)).await?;
        if positions.is_empty() {
            return Ok(Vec::new());
        }

        let mut file = File::open(self.steps.path()).await?;
        let mut steps = Vec::with_capacity(positions.len());
        for (seq, pos) in positions {
            let step: TrajectoryStep = read_record(&mut file, pos).await?;
            if step.trajectory_id != trajectory_id || step.step_seq != seq {
                return Err(LedgerError::Corrupt(format!(
                    "index points {trajectory_id}#{seq} at offset {}, which holds {}#{}",
                    pos.offset, step.trajectory_id, step.step_seq
                )));
            }
            steps.push(step);
        }
        Ok(steps)
    }

    /// One page of distinct trajectory ids matching `filter`.
    ///
    /// Pass the previous page's `next_cursor` to continue; `None` starts at
    /// the first page.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Validation`] for a malformed cursor, a zero `limit`,
    /// or a time range whose `since` is after its `until`.
    pub async fn list_trajectories(
        &self,
        filter: &TrajectoryFilter,
        limit: usize,
        cursor: Option<&str>,
        sort: SortOrder,
    ) -> Result<TrajectoryPage> {
        let offset = cursor.map(decode_cursor).transpose()?.unwrap_or(0);
        if limit == 0 {
            return Err(LedgerError::validation("limit must be at least 1"));
        }
        if let (Some(since), Some(until)) = (filter.since, filter.until)
            && since > until
        {
            return Err(LedgerError::validation("time range ends before it starts"));
        }
        self.refresh_if_stale().await?;

        let filter = filter.clone();
        let page = limit as u64;
        let mut trajectory_ids = self
            .with_index(move |ix| ix.list_trajectories(&filter, sort, offset, page + 1))
            .await?;
        let next_cursor = if trajectory_ids.len() > limit {
            trajectory_ids.truncate(limit);
            Some(encode_cursor(offset + page))
        } else {
            None
        };
        Ok(TrajectoryPage {
            trajectory_ids,
            next_cursor,
        })
    }

    /// Append one outcome.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Validation`] if the outcome is malformed, attaches to
    /// nothing, or reuses an `outcome_id`.
    pub async fn append_outcome(&self, outcome: &OutcomeRecorded) -> Result<()> {
        outcome.validate()?;
        let gate = self.write_gate.lock().await;
        self.ensure_fresh(&gate).await?;

        let outcome_id = outcome.outcome_id.clone();
        if self
            .with_index(move |ix| ix.outcome_exists(&outcome_id))
            .await?
        {
            return Err(LedgerError::validation(format!(
                "outcome {} already recorded",
                outcome.outcome_id
            )));
        }

        let pos = self.outcomes.append(outcome).await?;
        let record = outcome.clone();
        if let Err(err) = self
            .with_index(move |ix| ix.insert_outcomes(&[(pos, record)]))
            .await
        {
            self.mark_stale(&err);
        }
        tracing::debug!(
            outcome_id = %outcome.outcome_id,
            kind = %outcome.kind,
            "outcome appended"
        );
        Ok(())
    }

    /// Outcomes matching `filter`, oldest first.
    pub async fn list_outcomes(&self, filter: &OutcomeFilter) -> Result<Vec<OutcomeRecorded>> {
        self.refresh_if_stale().await?;
        let filter = filter.clone();
        let positions = self.with_index(move |ix| ix.outcome_positions(&filter)).await?;
        self.read_outcomes(positions).await
    }

    /// Outcomes attached to a trajectory, directly or through a command one
    /// of its steps issued. Oldest first.
    pub async fn outcomes_for_trajectory(&self, trajectory_id: &str) -> Result<Vec<OutcomeRecorded>> {
        self.refresh_if_stale().await?;
        let id = trajectory_id.to_owned();
        let positions = self
            .with_index(move |ix| ix.outcome_positions_for_trajectory(&id))
            .await?;
        self.read_outcomes(positions).await
    }

    /// Drop the index and rebuild it by replaying both logs.
    pub async fn rebuild_index(&self) -> Result<()> {
        let gate = self.write_gate.lock().await;
        self.rebuild(&gate).await
    }

    async fn read_outcomes(&self, positions: Vec<RecordPos>) -> Result<Vec<OutcomeRecorded>> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let mut file = File::open(self.outcomes.path()).await?;
        let mut out = Vec::with_capacity(positions.len());
        for pos in positions {
            out.push(read_record(&mut file, pos).await?);
        }
        Ok(out)
    }

    /// Run `f` against the index on the blocking pool.
    async fn with_index<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TrajectoryIndex) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || {
            let mut guard = index
                .lock()
                .map_err(|_| LedgerError::Index("index lock poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }

    fn mark_stale(&self, err: &LedgerError) {
        self.stale.store(true, Ordering::Release);
        tracing::warn!(error = %err, "record logged but not indexed; index will catch up");
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        if self.stale.load(Ordering::Acquire) {
            let gate = self.write_gate.lock().await;
            self.ensure_fresh(&gate).await?;
        }
        Ok(())
    }

    async fn ensure_fresh(&self, gate: &MutexGuard<'_, ()>) -> Result<()> {
        if self.stale.swap(false, Ordering::AcqRel)
            && let Err(err) = self.sync_index(gate).await
        {
            self.stale.store(true, Ordering::Release);
            return Err(err);
        }
        Ok(())
    }

    async fn sync_index(&self, gate: &MutexGuard<'_, ()>) -> Result<()> {
        let steps_len = self.steps.len().await;
        let outcomes_len = self.outcomes.len().await;
        let (steps_indexed, outcomes_indexed) = self
            .with_index(|ix| {
                Ok((
                    ix.indexed_len(LogKind::Steps)?,
                    ix.indexed_len(LogKind::Outcomes)?,
                ))
            })
            .await?;

        if steps_indexed > steps_len || outcomes_indexed > outcomes_len {
            tracing::warn!(
                steps_indexed,
                steps_len,
                outcomes_indexed,
                outcomes_len,
                "index covers more than the logs hold; rebuilding"
            );
            return self.rebuild(gate).await;
        }

        let steps = if steps_indexed < steps_len {
            self.catch_up::<TrajectoryStep, _>(&self.steps, steps_indexed, TrajectoryIndex::insert_steps)
                .await?
        } else {
            0
        };
        let outcomes = if outcomes_indexed < outcomes_len {
            self.catch_up::<OutcomeRecorded, _>(
                &self.outcomes,
                outcomes_indexed,
                TrajectoryIndex::insert_outcomes,
            )
                .await?
        } else {
            0
        };
        if steps + outcomes > 0 {
            tracing::info!(steps, outcomes, "trajectory index caught up");
        }
        Ok(())
    }

    async fn rebuild(&self, _gate: &MutexGuard<'_, ()>) -> Result<()> {
        self.with_index(|ix| ix.clear()).await?;
        let steps = self
            .catch_up::<TrajectoryStep, _>(&self.steps, 0, TrajectoryIndex::insert_steps)
            .await?;
        let outcomes = self
            .catch_up::<OutcomeRecorded, _>(&self.outcomes, 0, TrajectoryIndex::insert_outcomes)
            .await?;
        self.stale.store(false, Ordering::Release);
        tracing::info!(steps, outcomes, "trajectory index rebuilt");
        Ok(())
    }

    /// Index every record of `log` from byte `from` on, in batches.
    ///
    /// Returns the number of records newly indexed.
    async fn catch_up<T, F>(&self, log: &AppendLog, from: u64, insert: F) -> Result<usize>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(&mut TrajectoryIndex, &[(RecordPos, T)]) -> Result<usize> + Copy + Send + 'static,
    {
        let mut records = log.records_from::<T>(from).await?;
        let mut batch = Vec::with_capacity(INDEX_BATCH);
        let mut indexed = 0;
        while let Some(record) = records.next().await {
            batch.push(record?);
            if batch.len() == INDEX_BATCH {
                indexed += self.flush(std::mem::take(&mut batch), insert).await?;
            }
        }
        if !batch.is_empty() {
            indexed += self.flush(batch, insert).await?;
        }
        Ok(indexed)
    }

    async fn flush<T, F>(&self, batch: Vec<(RecordPos, T)>, insert: F) -> Result<usize>
    where
        T: Send + 'static,
        F: Fn(&mut TrajectoryIndex, &[(RecordPos, T)]) -> Result<usize> + Send + 'static,
    {
        let len = batch.len();
        let skipped = self.with_index(move |ix| insert(ix, &batch)).await?;
        if skipped > 0 {
            tracing::warn!(skipped, "duplicate trajectory records ignored while indexing");
        }
        Ok(len - skipped)
    }
}

/// Every step, then every outcome, each in log order.
impl EventSource<TrajectoryRecord> for TrajectoryStore {
    async fn events(&self) -> Result<BoxStream<'static, Result<TrajectoryRecord>>> {
        let steps = self
            .steps
            .records::<TrajectoryStep>()
            .await?
            .map_ok(|(_, step)| TrajectoryRecord::Step(step));
        let outcomes = self
            .outcomes
            .records::<OutcomeRecorded>()
            .await?
            .map_ok(|(_, outcome)| TrajectoryRecord::Outcome(outcome));
        Ok(steps.chain(outcomes).boxed())
    }

    async fn probe(&self) -> Result<SourceProbe> {
        let steps = self.steps.probe().await?;
        let outcomes = self.outcomes.probe().await?;
        Ok(SourceProbe {
            len: steps.len + outcomes.len,
            modified: steps.modified.max(outcomes.modified),
        })
    }
}
