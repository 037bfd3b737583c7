//! The generic command engine.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::aggregate::{Aggregate, Decision};
use crate::command::{CommandEnvelope, CommandOutcome, OutcomeStatus};
use crate::command_log::{CommandLog, StartStatus};
use crate::error::{LedgerError, Result};
use crate::event::{decode_tagged, encode_domain_event};
use crate::event_store::EventStore;
use crate::snapshot::{ReplayStrategy, replay};

/// Reason recorded on `already_processed` outcomes when a handler emits an
/// empty event list.
pub const NO_CHANGE_REASON: &str = "no_change";

/// Applies commands to an [`Aggregate`] with exactly-once semantics.
///
/// Each [`execute`](CommandLedger::execute) call:
///
/// 1. returns the stored outcome verbatim if `command_id` already finished;
/// 2. records a pending attempt (or reports a duplicate / in-flight one);
/// 3. rebuilds `A` from the [`EventStore`] via the [`ReplayStrategy`];
/// 4. lets `A::handle` decide, appends produced events, and persists the
///    outcome keyed by `command_id`.
///
/// Steps 3 and 4 run under a per-ledger write gate, so two commands sharing
/// one `CommandLedger` never interleave replay and append. Writers in other
/// processes, or other ledgers over the same log, are not coordinated.
///
/// Cloning is cheap: all clones share the gate and the stores.
pub struct CommandLedger<A: Aggregate> {
    events: Arc<EventStore>,
    commands: Arc<CommandLog>,
    strategy: ReplayStrategy,
    snapshot_path: PathBuf,
    gate: Arc<Mutex<()>>,
    _aggregate: std::marker::PhantomData<fn() -> A>,
}

impl<A: Aggregate> Clone for CommandLedger<A> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
            commands: Arc::clone(&self.commands),
            strategy: self.strategy,
            snapshot_path: self.snapshot_path.clone(),
            gate: Arc::clone(&self.gate),
            _aggregate: std::marker::PhantomData,
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for CommandLedger<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLedger")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> CommandLedger<A> {
    /// Build a ledger over the given stores.
    ///
    /// `snapshot_path` is only read or written under
    /// [`ReplayStrategy::Snapshot`].
    pub fn new(
        events: Arc<EventStore>,
        commands: Arc<CommandLog>,
        strategy: ReplayStrategy,
        snapshot_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            events,
            commands,
            strategy,
            snapshot_path: snapshot_path.into(),
            gate: Arc::new(Mutex::new(())),
            _aggregate: std::marker::PhantomData,
        }
    }

    /// The event store this ledger appends to.
    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    /// The command log this ledger records attempts in.
    pub fn commands(&self) -> &Arc<CommandLog> {
        &self.commands
    }

    /// Current aggregate state, rebuilt with the configured strategy.
    ///
    /// Waits for any command currently between replay and append.
    pub async fn state(&self) -> Result<A> {
        let _gate = self.gate.lock().await;
        replay::<A>(&self.events, self.strategy, &self.snapshot_path).await
    }

    /// Execute one command.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] for a malformed envelope.
    /// - [`LedgerError::InFlight`] while another attempt of the same logical
    ///   command is pending.
    /// - [`LedgerError::UnknownCommand`] if the type/payload does not decode
    ///   into `A::Command`.
    /// - [`LedgerError::PreconditionFailed`] from the handler.
    /// - Store-level errors from the logs.
    ///
    /// On every error after the attempt was started, the attempt is marked
    /// failed so a later resubmission starts fresh.
    pub async fn execute(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome> {
        envelope.validate()?;

        if let Some(outcome) = self
            .commands
            .get_by_idempotency_key(&envelope.command_id)
            .await
        {
            tracing::debug!(command_id = %envelope.command_id, "returning recorded outcome");
            return Ok(outcome);
        }

        let scope_key = envelope.scope_key();
        let start = self
            .commands
            .try_start(
                &envelope.command_id,
                envelope.idempotency_key(),
                &envelope.dedupe_scope,
                &scope_key,
            )
            .await?;
        match start {
            StartStatus::New => {}
            StartStatus::Duplicate(outcome) => {
                tracing::debug!(
                    command_id = %envelope.command_id,
                    original = %outcome.command_id,
                    "duplicate idempotency key; returning recorded outcome"
                );
                return Ok(outcome);
            }
            StartStatus::InFlight { command_id } => {
                return Err(LedgerError::InFlight { command_id });
            }
        }

        match self.run(envelope).await {
            Ok(outcome) => {
                self.commands
                    .complete(&envelope.command_id, &outcome)
                    .await?;
                tracing::info!(
                    command_id = %envelope.command_id,
                    command_type = %envelope.command_type,
                    status = ?outcome.status,
                    events = outcome.produced_events.len(),
                    "command executed"
                );
                Ok(outcome)
            }
            Err(err) => {
                tracing::warn!(
                    command_id = %envelope.command_id,
                    command_type = %envelope.command_type,
                    error = %err,
                    "command failed"
                );
                if let Err(mark_err) = self
                    .commands
                    .fail(&envelope.command_id, &err.to_string())
                    .await
                {
                    tracing::error!(
                        command_id = %envelope.command_id,
                        error = %mark_err,
                        "failed to record command failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome> {
        let command: A::Command = decode_tagged(&envelope.command_type, &envelope.payload)
            .map_err(|e| {
                LedgerError::UnknownCommand(format!("{}: {e}", envelope.command_type))
            })?;
        let ctx = envelope.context();

        let _gate = self.gate.lock().await;
        let state = replay::<A>(&self.events, self.strategy, &self.snapshot_path).await?;

        let events = match state.handle(command, &ctx)? {
            Decision::Emit(events) if events.is_empty() => {
                return Ok(CommandOutcome::without_events(
                    &envelope.command_id,
                    OutcomeStatus::AlreadyProcessed,
                    NO_CHANGE_REASON,
                ));
            }
            Decision::Emit(events) => events,
            Decision::NoChange { reason } => {
                return Ok(CommandOutcome::without_events(
                    &envelope.command_id,
                    OutcomeStatus::AlreadyProcessed,
                    reason,
                ));
            }
            Decision::Reject { reason } => {
                return Ok(CommandOutcome::without_events(
                    &envelope.command_id,
                    OutcomeStatus::Rejected,
                    reason,
                ));
            }
        };

        let mut produced = Vec::with_capacity(events.len());
        for event in &events {
            let stored = encode_domain_event(event, &ctx)?;
            self.events.append(&stored).await?;
            produced.push(stored.event_id);
        }
        Ok(CommandOutcome::accepted(&envelope.command_id, produced))
    }
}
