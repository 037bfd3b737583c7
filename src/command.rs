//! Command envelope, handler context, and outcome types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::event::encode_tagged;

/// Which slice of the world an idempotency key is unique within.
///
/// The scope key derived from it, paired with the idempotency key,
/// identifies exactly one logical command attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum DedupeScope {
    /// Unique per `target_ref`.
    #[default]
    Target,
    /// Unique across the whole ledger.
    Global,
    /// Unique within a caller-chosen namespace.
    Custom(String),
}

/// A request to change state, submitted to [`CommandLedger::execute`](crate::CommandLedger::execute).
///
/// `command_type` + `payload` form an adjacently tagged command
/// (`{"type": command_type, "data": payload}`) that the ledger decodes into
/// the aggregate's typed command enum.
///
/// # Examples
///
/// ```
/// use ledgerfold::{CommandEnvelope, DedupeScope};
/// use serde_json::json;
///
/// let cmd = CommandEnvelope::new("cmd-1", "task.create", json!({"task_id": "T1"}))
///     .with_target_ref("task:T1")
///     .with_actor("user-42");
///
/// assert_eq!(cmd.scope_key(), "target:task:T1");
/// assert_eq!(cmd.idempotency_key(), "cmd-1");
/// assert_eq!(cmd.dedupe_scope, DedupeScope::Target);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Unique id of this command; the exactly-once key.
    pub command_id: String,
    /// Command type tag (e.g. `"task.create"`).
    pub command_type: String,
    /// JSON payload for the command.
    pub payload: Value,
    /// The entity the command targets (e.g. `"task:T1"`).
    #[serde(default)]
    pub target_ref: String,
    /// Uniqueness scope of the idempotency key.
    #[serde(default)]
    pub dedupe_scope: DedupeScope,
    /// Explicit idempotency key; defaults to `command_id` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Correlation id shared by every command/event of one request.
    pub correlation_id: String,
    /// Id of whatever caused this command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Who issued the command.
    pub actor: String,
    /// When the command was requested.
    pub requested_at: DateTime<Utc>,
    /// Capability under which the command was issued, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
}

impl CommandEnvelope {
    /// Build an envelope with default metadata.
    ///
    /// The correlation id defaults to `command_id`, the actor to
    /// `"system"`, the scope to [`DedupeScope::Target`] and `requested_at`
    /// to now.
    pub fn new(command_id: impl Into<String>, command_type: impl Into<String>, payload: Value) -> Self {
        let command_id = command_id.into();
        Self {
            correlation_id: command_id.clone(),
            command_id,
            command_type: command_type.into(),
            payload,
            target_ref: String::new(),
            dedupe_scope: DedupeScope::Target,
            idempotency_key: None,
            causation_id: None,
            actor: "system".to_owned(),
            requested_at: Utc::now(),
            capability_id: None,
        }
    }

    /// Build an envelope from a typed, adjacently tagged command.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Serialization`] if `command` does not encode
    /// as a tagged object.
    pub fn from_command<C: Serialize>(command_id: impl Into<String>, command: &C) -> Result<Self> {
        let (command_type, payload) = encode_tagged(command)?;
        Ok(Self::new(command_id, command_type, payload))
    }

    /// Build an envelope with a fresh random command id.
    pub fn generated(command_type: impl Into<String>, payload: Value) -> Self {
        Self::new(Uuid::new_v4().to_string(), command_type, payload)
    }

    /// Set the target reference.
    pub fn with_target_ref(mut self, target_ref: impl Into<String>) -> Self {
        self.target_ref = target_ref.into();
        self
    }

    /// Set the dedupe scope.
    pub fn with_dedupe_scope(mut self, scope: DedupeScope) -> Self {
        self.dedupe_scope = scope;
        self
    }

    /// Set an explicit idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Set the causation id.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Set the actor.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Set the request time.
    pub fn requested_at(mut self, at: DateTime<Utc>) -> Self {
        self.requested_at = at;
        self
    }

    /// Set the capability id.
    pub fn with_capability_id(mut self, id: impl Into<String>) -> Self {
        self.capability_id = Some(id.into());
        self
    }

    /// The idempotency key: the explicit one, or the command id.
    pub fn idempotency_key(&self) -> &str {
        self.idempotency_key.as_deref().unwrap_or(&self.command_id)
    }

    /// Scope key derived from [`dedupe_scope`](CommandEnvelope::dedupe_scope).
    ///
    /// `target:<target_ref>`, `global`, or `custom:<key>`.
    pub fn scope_key(&self) -> String {
        match &self.dedupe_scope {
            DedupeScope::Target => format!("target:{}", self.target_ref),
            DedupeScope::Global => "global".to_owned(),
            DedupeScope::Custom(key) => format!("custom:{key}"),
        }
    }

    /// Reject envelopes that cannot be tracked by the command log.
    pub fn validate(&self) -> Result<()> {
        if self.command_id.trim().is_empty() {
            return Err(LedgerError::validation("command_id must not be empty"));
        }
        if self.command_type.trim().is_empty() {
            return Err(LedgerError::validation("command_type must not be empty"));
        }
        if self.idempotency_key().trim().is_empty() {
            return Err(LedgerError::validation("idempotency key must not be empty"));
        }
        if let DedupeScope::Custom(key) = &self.dedupe_scope
            && key.trim().is_empty()
        {
            return Err(LedgerError::validation("custom dedupe scope must not be empty"));
        }
        Ok(())
    }

    /// Metadata handed to the aggregate's command handler.
    pub fn context(&self) -> CommandContext {
        CommandContext {
            command_id: self.command_id.clone(),
            actor: self.actor.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            target_ref: self.target_ref.clone(),
            requested_at: self.requested_at,
            capability_id: self.capability_id.clone(),
        }
    }
}

/// Cross-cutting metadata passed alongside a decoded command.
///
/// Carries audit trail and correlation information without polluting the
/// command enum. Fields are copied onto every event the command produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Id of the command being handled.
    pub command_id: String,
    /// Identity of the actor issuing the command.
    pub actor: String,
    /// Correlation ID for tracing a request across commands and events.
    pub correlation_id: String,
    /// Id of whatever caused the command.
    pub causation_id: Option<String>,
    /// The entity the command targets.
    pub target_ref: String,
    /// When the command was requested; becomes `occurred_at` on events.
    pub requested_at: DateTime<Utc>,
    /// Capability under which the command was issued.
    pub capability_id: Option<String>,
}

impl CommandContext {
    /// Context for `command_id` with default metadata.
    pub fn new(command_id: impl Into<String>) -> Self {
        let command_id = command_id.into();
        Self {
            correlation_id: command_id.clone(),
            command_id,
            actor: "system".to_owned(),
            causation_id: None,
            target_ref: String::new(),
            requested_at: Utc::now(),
            capability_id: None,
        }
    }

    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Set the target reference.
    pub fn with_target_ref(mut self, target_ref: impl Into<String>) -> Self {
        self.target_ref = target_ref.into();
        self
    }

    /// Set the request time.
    pub fn requested_at(mut self, at: DateTime<Utc>) -> Self {
        self.requested_at = at;
        self
    }
}

/// Final status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The command produced one or more events.
    Accepted,
    /// The handler refused the command for a business reason.
    Rejected,
    /// The command could not be carried out.
    Failed,
    /// Nothing to do: either a replayed duplicate or a legitimate no-op.
    AlreadyProcessed,
}

/// Durable result of one command, keyed by `command_id`.
///
/// `already_processed` covers both a no-op decision and a replayed
/// duplicate; tell them apart by `produced_events` and `reason`, never by
/// `status` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// The command this outcome belongs to.
    pub command_id: String,
    /// Final status.
    pub status: OutcomeStatus,
    /// Ids of events appended by this command, in append order.
    pub produced_events: Vec<Uuid>,
    /// Human-readable reason for non-accepted outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the outcome was recorded.
    pub completed_at: DateTime<Utc>,
}

impl CommandOutcome {
    /// An `accepted` outcome listing the appended events.
    pub fn accepted(command_id: impl Into<String>, produced_events: Vec<Uuid>) -> Self {
        Self {
            command_id: command_id.into(),
            status: OutcomeStatus::Accepted,
            produced_events,
            reason: None,
            completed_at: Utc::now(),
        }
    }

    /// An event-less outcome with the given status and reason.
    pub fn without_events(
        command_id: impl Into<String>,
        status: OutcomeStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            status,
            produced_events: Vec::new(),
            reason: Some(reason.into()),
            completed_at: Utc::now(),
        }
    }

    /// Whether this outcome is final (anything but `failed`).
    pub fn is_final(&self) -> bool {
        self.status != OutcomeStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_envelope_defaults() {
        let cmd = CommandEnvelope::new("c1", "task.create", json!({}));
        assert_eq!(cmd.correlation_id, "c1");
        assert_eq!(cmd.actor, "system");
        assert_eq!(cmd.dedupe_scope, DedupeScope::Target);
        assert_eq!(cmd.idempotency_key(), "c1");
    }

    #[test]
    fn scope_keys_per_scope() {
        let base = CommandEnvelope::new("c1", "t", json!({})).with_target_ref("task:T1");
        assert_eq!(base.scope_key(), "target:task:T1");
        assert_eq!(
            base.clone().with_dedupe_scope(DedupeScope::Global).scope_key(),
            "global"
        );
        assert_eq!(
            base.with_dedupe_scope(DedupeScope::Custom("inbox".into()))
                .scope_key(),
            "custom:inbox"
        );
    }

    #[test]
    fn explicit_idempotency_key_wins() {
        let cmd = CommandEnvelope::new("c1", "t", json!({})).with_idempotency_key("form-7");
        assert_eq!(cmd.idempotency_key(), "form-7");
    }

    #[test]
    fn validate_rejects_empty_ids() {
        let err = CommandEnvelope::new("  ", "t", json!({}))
            .validate()
            .expect_err("blank command id must fail");
        assert!(matches!(err, LedgerError::Validation(_)));

        let err = CommandEnvelope::new("c1", "t", json!({}))
            .with_dedupe_scope(DedupeScope::Custom(String::new()))
            .validate()
            .expect_err("blank custom scope must fail");
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn context_copies_metadata() {
        let cmd = CommandEnvelope::new("c1", "t", json!({}))
            .with_actor("alice")
            .with_correlation_id("req-1")
            .with_causation_id("evt-0")
            .with_target_ref("task:T1")
            .with_capability_id("cap-1");
        let ctx = cmd.context();
        assert_eq!(ctx.command_id, "c1");
        assert_eq!(ctx.actor, "alice");
        assert_eq!(ctx.correlation_id, "req-1");
        assert_eq!(ctx.causation_id.as_deref(), Some("evt-0"));
        assert_eq!(ctx.target_ref, "task:T1");
        assert_eq!(ctx.capability_id.as_deref(), Some("cap-1"));
        assert_eq!(ctx.requested_at, cmd.requested_at);
    }

    #[test]
    fn dedupe_scope_serde_shape() {
        let json = serde_json::to_value(DedupeScope::Custom("x".into())).expect("serialize");
        assert_eq!(json, json!({"kind": "custom", "key": "x"}));
        let json = serde_json::to_value(DedupeScope::Global).expect("serialize");
        assert_eq!(json, json!({"kind": "global"}));
    }

    #[test]
    fn outcome_status_is_snake_case() {
        let json = serde_json::to_value(OutcomeStatus::AlreadyProcessed).expect("serialize");
        assert_eq!(json, json!("already_processed"));
    }

    #[test]
    fn envelope_serde_roundtrip() {
        let cmd = CommandEnvelope::new("c1", "task.create", json!({"task_id": "T1"}))
            .with_dedupe_scope(DedupeScope::Custom("k".into()))
            .with_causation_id("x");
        let json = serde_json::to_string(&cmd).expect("serialization should succeed");
        let back: CommandEnvelope =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, cmd);
    }
}
