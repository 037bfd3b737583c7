//! Deterministic conflict resolution for values observed from several
//! overlapping signals.
//!
//! Candidates are compared by a total order: lower priority rank first,
//! then earliest `occurred_at`, then the lexicographically smallest
//! `source_ref`. The winner is the minimum, so it does not depend on the
//! order in which candidates were offered.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed value for a merged field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate<T> {
    /// The observed value.
    pub value: T,
    /// Priority rank; `0` beats `1`.
    pub rank: u32,
    /// When the observation happened.
    pub occurred_at: DateTime<Utc>,
    /// Reference to the record the value came from.
    pub source_ref: String,
}

impl<T> Candidate<T> {
    /// Compare by rank, then time, then source reference.
    ///
    /// Candidates that tie on all three compare equal; the first one offered
    /// is kept, and since such candidates share a source they normally
    /// carry the same value.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.occurred_at.cmp(&other.occurred_at))
            .then_with(|| self.source_ref.cmp(&other.source_ref))
    }
}

/// A field whose value is the best candidate seen so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merged<T> {
    best: Option<Candidate<T>>,
}

impl<T> Default for Merged<T> {
    fn default() -> Self {
        Self { best: None }
    }
}

impl<T> Merged<T> {
    /// Offer a candidate; keeps it if it outranks the current winner.
    ///
    /// Returns `true` when the winner changed.
    pub fn offer(&mut self, candidate: Candidate<T>) -> bool {
        match &self.best {
            Some(best) if candidate.precedence(best) != Ordering::Less => false,
            _ => {
                self.best = Some(candidate);
                true
            }
        }
    }

    /// The winning value.
    pub fn value(&self) -> Option<&T> {
        self.best.as_ref().map(|c| &c.value)
    }

    /// The winning candidate with its provenance.
    pub fn winner(&self) -> Option<&Candidate<T>> {
        self.best.as_ref()
    }
}

/// Pick the winner of a candidate set.
pub fn resolve<'a, T>(candidates: impl IntoIterator<Item = &'a Candidate<T>>) -> Option<&'a Candidate<T>>
where
    T: 'a,
{
    candidates.into_iter().min_by(|a, b| a.precedence(b))
}
