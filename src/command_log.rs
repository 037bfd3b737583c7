//! Durable idempotency ledger for command attempts.
//!
//! Two append-only logs back the ledger: an *attempts* log of
//! `pending`/`completed`/`failed` transitions keyed by
//! `(scope_key, idempotency_key)`, and an *outcomes* log holding the final
//! [`CommandOutcome`] per `command_id`. The current status of every command
//! is the most recent record for it, rebuilt into memory at open time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::command::{CommandOutcome, DedupeScope, OutcomeStatus};
use crate::error::{LedgerError, Result};
use crate::storage::AppendLog;

/// Default age after which a pending attempt is treated as abandoned.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Lifecycle state of one command attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Started, not yet finished.
    Pending,
    /// Finished with a final outcome.
    Completed,
    /// Finished without a final outcome; may be retried.
    Failed,
}

/// One line of the attempts log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Command this attempt belongs to.
    pub command_id: String,
    /// Scope key derived from the dedupe scope.
    pub scope_key: String,
    /// Idempotency key within the scope.
    pub idempotency_key: String,
    /// The dedupe scope as submitted.
    pub dedupe_scope: DedupeScope,
    /// Status after this transition.
    pub status: AttemptStatus,
    /// When the transition was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Result of [`CommandLog::try_start`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartStatus {
    /// No live attempt exists; the caller owns this command now and must
    /// finish it with [`complete`](CommandLog::complete) or
    /// [`fail`](CommandLog::fail).
    New,
    /// Another attempt of the same logical command is pending.
    InFlight {
        /// Command id of the pending attempt.
        command_id: String,
    },
    /// The logical command already finished; here is its outcome.
    Duplicate(CommandOutcome),
}

type AttemptKey = (String, String);

#[derive(Debug, Default)]
struct LedgerIndex {
    by_key: HashMap<AttemptKey, AttemptRecord>,
    key_of: HashMap<String, AttemptKey>,
    outcomes: HashMap<String, CommandOutcome>,
}

impl LedgerIndex {
    fn record_attempt(&mut self, attempt: AttemptRecord) {
        let key = (attempt.scope_key.clone(), attempt.idempotency_key.clone());
        self.key_of.insert(attempt.command_id.clone(), key.clone());
        self.by_key.insert(key, attempt);
    }
}

/// Durable exactly-once ledger.
///
/// All check-and-record operations run under one async lock, so two
/// concurrent [`try_start`](CommandLog::try_start) calls for the same
/// logical command cannot both observe `New`.
#[derive(Debug)]
pub struct CommandLog {
    attempts: AppendLog,
    outcomes: AppendLog,
    index: Mutex<LedgerIndex>,
    pending_timeout: TimeDelta,
}

impl CommandLog {
    /// Open (or create) the ledger and rebuild its in-memory index.
    pub async fn open(
        attempts_path: impl Into<PathBuf>,
        outcomes_path: impl Into<PathBuf>,
        fsync: bool,
    ) -> Result<Self> {
        let attempts = AppendLog::open(attempts_path, fsync).await?;
        let outcomes = AppendLog::open(outcomes_path, fsync).await?;

        let mut index = LedgerIndex::default();
        let mut records = attempts.records::<AttemptRecord>().await?;
        while let Some(item) = records.next().await {
            let (_, attempt) = item?;
            index.record_attempt(attempt);
        }
        let mut records = outcomes.records::<CommandOutcome>().await?;
        while let Some(item) = records.next().await {
            let (_, outcome) = item?;
            index.outcomes.insert(outcome.command_id.clone(), outcome);
        }
        tracing::debug!(
            attempts = index.key_of.len(),
            outcomes = index.outcomes.len(),
            "command log opened"
        );

        Ok(Self {
            attempts,
            outcomes,
            index: Mutex::new(index),
            pending_timeout: to_delta(DEFAULT_PENDING_TIMEOUT),
        })
    }

    /// Set the age after which a pending attempt counts as abandoned.
    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = to_delta(timeout);
        self
    }

    /// The final outcome recorded for `command_id`, if any.
    ///
    /// Outcomes with status `failed` are not final and are never returned.
    pub async fn get_by_idempotency_key(&self, command_id: &str) -> Option<CommandOutcome> {
        self.index
            .lock()
            .await
            .outcomes
            .get(command_id)
            .filter(|o| o.is_final())
            .cloned()
    }

    /// Decide whether the logical command `(scope_key, idempotency_key)`
    /// may start, and record a pending attempt when it may.
    pub async fn try_start(
        &self,
        command_id: &str,
        idempotency_key: &str,
        dedupe_scope: &DedupeScope,
        scope_key: &str,
    ) -> Result<StartStatus> {
        let mut index = self.index.lock().await;
        let key = (scope_key.to_owned(), idempotency_key.to_owned());

        if let Some(latest) = index.by_key.get(&key) {
            match latest.status {
                AttemptStatus::Completed => {
                    return match index.outcomes.get(&latest.command_id) {
                        Some(outcome) => Ok(StartStatus::Duplicate(outcome.clone())),
                        None => Err(LedgerError::Corrupt(format!(
                            "attempt for command {} completed without an outcome",
                            latest.command_id
                        ))),
                    };
                }
                AttemptStatus::Pending => {
                    let age = Utc::now() - latest.recorded_at;
                    if age < self.pending_timeout {
                        return Ok(StartStatus::InFlight {
                            command_id: latest.command_id.clone(),
                        });
                    }
                    tracing::warn!(
                        command_id = %latest.command_id,
                        scope_key,
                        age_ms = age.num_milliseconds(),
                        "restarting abandoned pending attempt"
                    );
                }
                AttemptStatus::Failed => {}
            }
        }

        let attempt = AttemptRecord {
            command_id: command_id.to_owned(),
            scope_key: scope_key.to_owned(),
            idempotency_key: idempotency_key.to_owned(),
            dedupe_scope: dedupe_scope.clone(),
            status: AttemptStatus::Pending,
            recorded_at: Utc::now(),
        };
        self.attempts.append(&attempt).await?;
        index.record_attempt(attempt);
        Ok(StartStatus::New)
    }

    /// Record the final outcome of a started command.
    ///
    /// The outcome is written before the attempt transition, so a crash in
    /// between leaves a pending attempt whose outcome is already readable
    /// through [`get_by_idempotency_key`](CommandLog::get_by_idempotency_key).
    /// An outcome with status `failed` transitions the attempt to `failed`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Validation`] if no attempt was started for
    /// `command_id`.
    pub async fn complete(&self, command_id: &str, outcome: &CommandOutcome) -> Result<()> {
        let mut index = self.index.lock().await;
        let Some(key) = index.key_of.get(command_id).cloned() else {
            return Err(LedgerError::validation(format!(
                "no attempt recorded for command {command_id}"
            )));
        };
        let Some(started) = index.by_key.get(&key).cloned() else {
            return Err(LedgerError::Corrupt(format!(
                "attempt index missing entry for command {command_id}"
            )));
        };

        self.outcomes.append(outcome).await?;
        index.outcomes.insert(command_id.to_owned(), outcome.clone());

        let status = if outcome.status == OutcomeStatus::Failed {
            AttemptStatus::Failed
        } else {
            AttemptStatus::Completed
        };
        let attempt = AttemptRecord {
            command_id: command_id.to_owned(),
            status,
            recorded_at: Utc::now(),
            ..started
        };
        self.attempts.append(&attempt).await?;
        index.record_attempt(attempt);

        tracing::debug!(command_id, status = ?outcome.status, "command outcome recorded");
        Ok(())
    }

    /// Mark a started command as failed so it may be retried.
    pub async fn fail(&self, command_id: &str, reason: &str) -> Result<()> {
        let outcome = CommandOutcome::without_events(command_id, OutcomeStatus::Failed, reason);
        self.complete(command_id, &outcome).await
    }

    /// Latest attempt recorded for `command_id`.
    pub async fn attempt(&self, command_id: &str) -> Option<AttemptRecord> {
        let index = self.index.lock().await;
        let key = index.key_of.get(command_id)?;
        index
            .by_key
            .get(key)
            .filter(|a| a.command_id == command_id)
            .cloned()
    }
}

fn to_delta(timeout: Duration) -> TimeDelta {
    TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> CommandLog {
        CommandLog::open(
            tmp.path().join("attempts.jsonl"),
            tmp.path().join("outcomes.jsonl"),
            false,
        )
        .await
        .expect("open should succeed")
    }

    async fn start(log: &CommandLog, command_id: &str, key: &str) -> StartStatus {
        log.try_start(command_id, key, &DedupeScope::Global, "global")
            .await
            .expect("try_start should succeed")
    }

    #[tokio::test]
    async fn first_start_is_new_then_in_flight() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = open(&tmp).await;

        assert_eq!(start(&log, "c1", "k1").await, StartStatus::New);
        assert_eq!(
            start(&log, "c2", "k1").await,
            StartStatus::InFlight {
                command_id: "c1".into()
            }
        );
        // Other keys are unaffected.
        assert_eq!(start(&log, "c3", "k2").await, StartStatus::New);
    }

    #[tokio::test]
    async fn completed_command_is_duplicate() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = open(&tmp).await;
        start(&log, "c1", "k1").await;
        let outcome = CommandOutcome::accepted("c1", vec![uuid::Uuid::new_v4()]);
        log.complete("c1", &outcome).await.expect("complete should succeed");

        assert_eq!(
            start(&log, "c1", "k1").await,
            StartStatus::Duplicate(outcome.clone())
        );
        assert_eq!(log.get_by_idempotency_key("c1").await, Some(outcome));
    }

    #[tokio::test]
    async fn failed_attempt_may_restart() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = open(&tmp).await;
        start(&log, "c1", "k1").await;
        log.fail("c1", "disk full").await.expect("fail should succeed");

        assert!(log.get_by_idempotency_key("c1").await.is_none());
        assert_eq!(start(&log, "c1", "k1").await, StartStatus::New);
    }

    #[tokio::test]
    async fn abandoned_pending_attempt_restarts() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = open(&tmp).await.with_pending_timeout(Duration::ZERO);
        start(&log, "c1", "k1").await;
        assert_eq!(start(&log, "c1", "k1").await, StartStatus::New);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let outcome = CommandOutcome::without_events("c1", OutcomeStatus::Rejected, "nope");
        {
            let log = open(&tmp).await;
            start(&log, "c1", "k1").await;
            log.complete("c1", &outcome).await.expect("complete should succeed");
            start(&log, "c2", "k2").await;
        }
        let log = open(&tmp).await;
        assert_eq!(log.get_by_idempotency_key("c1").await, Some(outcome));
        assert_eq!(
            start(&log, "c9", "k2").await,
            StartStatus::InFlight {
                command_id: "c2".into()
            }
        );
        let attempt = log.attempt("c1").await.expect("attempt should exist");
        assert_eq!(attempt.status, AttemptStatus::Completed);
    }

    #[tokio::test]
    async fn complete_without_start_is_validation_error() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = open(&tmp).await;
        let err = log
            .complete("ghost", &CommandOutcome::accepted("ghost", vec![]))
            .await
            .expect_err("complete without start must fail");
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn scope_keys_isolate_idempotency_keys() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = open(&tmp).await;
        let a = log
            .try_start("c1", "k", &DedupeScope::Target, "target:task:A")
            .await
            .expect("try_start should succeed");
        let b = log
            .try_start("c2", "k", &DedupeScope::Target, "target:task:B")
            .await
            .expect("try_start should succeed");
        assert_eq!(a, StartStatus::New);
        assert_eq!(b, StartStatus::New);
    }
}
