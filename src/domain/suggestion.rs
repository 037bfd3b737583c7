//! Confidence-based suggestion supersession.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::Decision;
use crate::domain::workspace::WorkspaceEvent;

/// A new proposal replaces the current suggestion only when its confidence
/// exceeds the current one by more than this margin.
pub const SUPERSEDE_MIN_CONFIDENCE_GAIN: f64 = 0.1;

/// The suggestion currently held for a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Suggested value.
    pub value: Value,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Number of suggestions accepted for this target so far.
    pub revision: u64,
}

/// Decide what a proposal does given the current suggestion for its target.
///
/// - Confidence outside `[0, 1]` (or NaN) is rejected.
/// - With no current suggestion the proposal is accepted as-is.
/// - The same value as the current suggestion is a no-op.
/// - Otherwise it supersedes only if `confidence > current +`
///   [`SUPERSEDE_MIN_CONFIDENCE_GAIN`]; the superseding event records the
///   prior confidence.
pub fn decide_proposal(
    current: Option<&Suggestion>,
    target_ref: String,
    value: Value,
    confidence: f64,
) -> Decision<WorkspaceEvent> {
    if !(0.0..=1.0).contains(&confidence) {
        return Decision::reject(format!("confidence {confidence} is outside [0, 1]"));
    }
    let Some(current) = current else {
        return Decision::emit(WorkspaceEvent::SuggestionProposed {
            target_ref,
            value,
            confidence,
            revision: 1,
        });
    };
    if current.value == value {
        return Decision::no_change("same_value");
    }
    if confidence <= current.confidence + SUPERSEDE_MIN_CONFIDENCE_GAIN {
        return Decision::no_change("insufficient_confidence_gain");
    }
    Decision::emit(WorkspaceEvent::SuggestionSuperseded {
        target_ref,
        value,
        confidence,
        prior_confidence: current.confidence,
        revision: current.revision + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn current(confidence: f64) -> Suggestion {
        Suggestion {
            value: json!("Acme Inc"),
            confidence,
            revision: 1,
        }
    }

    #[test]
    fn first_proposal_is_accepted() {
        let decision = decide_proposal(None, "contact:1/company".into(), json!("Acme"), 0.4);
        assert!(matches!(
            decision,
            Decision::Emit(ref events) if matches!(events[0], WorkspaceEvent::SuggestionProposed { revision: 1, .. })
        ));
    }

    #[test]
    fn small_gain_does_not_supersede() {
        let decision = decide_proposal(Some(&current(0.5)), "t".into(), json!("Acme Corp"), 0.6);
        assert_eq!(decision, Decision::no_change("insufficient_confidence_gain"));
    }

    #[test]
    fn large_gain_supersedes_and_records_prior() {
        let decision = decide_proposal(Some(&current(0.5)), "t".into(), json!("Acme Corp"), 0.75);
        assert_eq!(
            decision,
            Decision::emit(WorkspaceEvent::SuggestionSuperseded {
                target_ref: "t".into(),
                value: json!("Acme Corp"),
                confidence: 0.75,
                prior_confidence: 0.5,
                revision: 2,
            })
        );
    }

    #[test]
    fn same_value_is_no_change() {
        let decision = decide_proposal(Some(&current(0.1)), "t".into(), json!("Acme Inc"), 0.9);
        assert_eq!(decision, Decision::no_change("same_value"));
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        for bad in [-0.1, 1.5, f64::NAN] {
            let decision = decide_proposal(None, "t".into(), json!(1), bad);
            assert!(matches!(decision, Decision::Reject { .. }), "confidence {bad}");
        }
    }
}
