//! Aggregate trait, handler decisions, and the envelope reducer.

use serde::{Serialize, de::DeserializeOwned};

use crate::command::CommandContext;
use crate::error::Result;
use crate::event::EventEnvelope;

/// What a command handler decided to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision<E> {
    /// Append these events. An empty list is treated as [`Decision::NoChange`].
    Emit(Vec<E>),
    /// The state already satisfies the command; append nothing.
    ///
    /// Recorded as an `already_processed` outcome carrying `reason`.
    NoChange {
        /// Why nothing changed (e.g. `"already_completed"`).
        reason: String,
    },
    /// Refuse the command for a business reason that is not a state
    /// precondition. Recorded as a `rejected` outcome.
    Reject {
        /// Why the command was refused.
        reason: String,
    },
}

impl<E> Decision<E> {
    /// Emit a single event.
    pub fn emit(event: E) -> Self {
        Decision::Emit(vec![event])
    }

    /// A no-op decision with the given reason.
    pub fn no_change(reason: impl Into<String>) -> Self {
        Decision::NoChange {
            reason: reason.into(),
        }
    }

    /// A rejection with the given reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        Decision::Reject {
            reason: reason.into(),
        }
    }
}

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state. State is
/// built by folding the whole event log through [`apply`](Aggregate::apply)
/// and is never persisted on its own, except as an optional snapshot that
/// must reproduce full replay exactly.
///
/// # Associated Types
///
/// - `Command`: adjacently tagged enum (`#[serde(tag = "type", content = "data")]`)
///   decoded from an envelope's `command_type` and `payload`.
/// - `DomainEvent`: adjacently tagged enum of the events this aggregate
///   produces and applies.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) is a pure decision function: no I/O, no
///   side effects. Precondition violations are returned as
///   [`LedgerError::PreconditionFailed`](crate::LedgerError::PreconditionFailed).
/// - [`apply`](Aggregate::apply) is a pure, total function. Events the
///   aggregate does not know never reach it; they are skipped by the reducer.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "workspace"). Used as the
    /// snapshot directory name.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: DeserializeOwned + Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Validate a command against the current state and decide its effect.
    fn handle(&self, cmd: Self::Command, ctx: &CommandContext) -> Result<Decision<Self::DomainEvent>>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// Fold one stored envelope into aggregate state.
///
/// Envelopes whose type/payload do not decode into `A::DomainEvent` leave
/// the state unchanged, so logs shared with other aggregates or written by
/// newer versions replay cleanly.
pub fn reduce<A: Aggregate>(state: A, envelope: &EventEnvelope) -> A {
    match envelope.decode::<A::DomainEvent>() {
        Some(event) => state.apply(&event),
        None => state,
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{Counter, CounterCommand, CounterEvent};
    use super::*;
    use crate::LedgerError;
    use crate::event::encode_domain_event;

    fn ctx() -> CommandContext {
        CommandContext::new("cmd-1")
    }

    #[test]
    fn handle_add_emits_event() {
        let decision = Counter::default()
            .handle(CounterCommand::Add { amount: 5 }, &ctx())
            .unwrap();
        assert_eq!(decision, Decision::emit(CounterEvent::Added { amount: 5, seq: 1 }));
    }

    #[test]
    fn handle_take_beyond_value_is_precondition_failure() {
        let err = Counter { value: 2, applied: 1 }
            .handle(CounterCommand::Take { amount: 3 }, &ctx())
            .unwrap_err();
        match err {
            LedgerError::PreconditionFailed { expected, actual } => {
                assert_eq!(expected, "at least 3");
                assert_eq!(actual, "2");
            }
            other => panic!("expected PreconditionFailed, got: {other}"),
        }
    }

    #[test]
    fn handle_reset_at_zero_is_no_change() {
        let decision = Counter::default()
            .handle(CounterCommand::Reset, &ctx())
            .unwrap();
        assert_eq!(decision, Decision::no_change("already_zero"));
    }

    #[test]
    fn handle_then_apply_roundtrip() {
        let counter = Counter::default();
        let Decision::Emit(events) = counter.handle(CounterCommand::Add { amount: 4 }, &ctx()).unwrap()
        else {
            panic!("expected Emit");
        };
        let state = events.iter().fold(Counter::default(), |s, e| s.apply(e));
        assert_eq!(state.value, 4);
        assert_eq!(state.applied, 1);
    }

    #[test]
    fn reduce_decodes_envelopes() {
        let env = encode_domain_event(&CounterEvent::Added { amount: 7, seq: 1 }, &ctx()).unwrap();
        let state = reduce(Counter::default(), &env);
        assert_eq!(state.value, 7);
    }

    #[test]
    fn reduce_skips_unknown_events() {
        let env = EventEnvelope::new("other.thing", serde_json::json!({"x": 1}));
        let state = reduce(Counter { value: 3, applied: 1 }, &env);
        assert_eq!(state, Counter { value: 3, applied: 1 });
    }
}
