//! Contact directory projection.
//!
//! Calendar connectors append one `contact.observed` event per person seen
//! on an event, tagged with the role they played and the record they were
//! seen in. A person seen in several
//! places yields overlapping signals; the display name is resolved with the
//! [`merge`](crate::merge) total order, organizer signals outranking
//! attendee ones.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::EventEnvelope;
use crate::merge::{Candidate, Merged};
use crate::projection::{Freshness, ProjectionDefinition};

/// Event type consumed by [`ContactDirectory`].
pub const CONTACT_OBSERVED: &str = "contact.observed";

/// Role a contact played in the observed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactRole {
    /// Organised the calendar event.
    Organizer,
    /// Attended the calendar event.
    Attendee,
}

impl ContactRole {
    /// Merge priority rank; organizer signals win.
    pub fn rank(self) -> u32 {
        match self {
            ContactRole::Organizer => 0,
            ContactRole::Attendee => 1,
        }
    }
}

/// Payload of a `contact.observed` event.
///
/// `source_ref` is part of the payload, so sightings of the same person in
/// different records get different event ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactObserved {
    /// Email address; matched case-insensitively.
    pub email: String,
    /// Name as shown in the source record.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Role in the source record.
    pub role: ContactRole,
    /// The record the contact was seen in (e.g. `"cal:42"`).
    pub source_ref: String,
}

impl ContactObserved {
    /// Wrap the observation in an envelope that happened at `occurred_at`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Serialization`](crate::LedgerError::Serialization)
    /// if the payload cannot be encoded.
    pub fn to_envelope(&self, occurred_at: DateTime<Utc>) -> Result<EventEnvelope> {
        let payload = serde_json::to_value(self)?;
        Ok(EventEnvelope::new(CONTACT_OBSERVED, payload)
            .occurred_at(occurred_at)
            .with_source_ref(self.source_ref.clone()))
    }
}

/// One merged contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactView {
    /// Normalised (lowercase) email.
    pub email: String,
    /// Winning display name.
    pub display_name: Merged<String>,
    /// Every role the contact was seen in.
    pub roles: BTreeSet<ContactRole>,
    /// Every source record that mentioned the contact.
    pub sources: BTreeSet<String>,
    /// Earliest observation.
    pub first_seen: DateTime<Utc>,
}

/// Directory state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactDirectoryView {
    /// Contacts by normalised email.
    pub contacts: BTreeMap<String, ContactView>,
    /// Last folded event.
    pub freshness: Freshness,
}

impl ContactDirectoryView {
    /// Look up a contact by email, ignoring case.
    pub fn get(&self, email: &str) -> Option<&ContactView> {
        self.contacts.get(&email.trim().to_lowercase())
    }
}

/// Folds `contact.observed` events into a [`ContactDirectoryView`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ContactDirectory;

impl ProjectionDefinition for ContactDirectory {
    const NAME: &'static str = "contact-directory";
    const VERSION: u32 = 1;
    type Event = EventEnvelope;
    type State = ContactDirectoryView;

    fn init(&self) -> ContactDirectoryView {
        ContactDirectoryView::default()
    }

    fn apply(&self, mut state: ContactDirectoryView, envelope: &EventEnvelope) -> ContactDirectoryView {
        state.freshness = Freshness::of_event(envelope);
        if envelope.event_type != CONTACT_OBSERVED {
            return state;
        }
        let Ok(observed) = serde_json::from_value::<ContactObserved>(envelope.payload.clone()) else {
            return state;
        };
        let email = observed.email.trim().to_lowercase();
        if email.is_empty() {
            return state;
        }
        let source_ref = observed.source_ref;

        let contact = state
            .contacts
            .entry(email.clone())
            .or_insert_with(|| ContactView {
                email,
                display_name: Merged::default(),
                roles: BTreeSet::new(),
                sources: BTreeSet::new(),
                first_seen: envelope.occurred_at,
            });
        contact.first_seen = contact.first_seen.min(envelope.occurred_at);
        contact.roles.insert(observed.role);
        contact.sources.insert(source_ref.clone());
        if let Some(name) = observed.display_name.filter(|n| !n.trim().is_empty()) {
            contact.display_name.offer(Candidate {
                value: name,
                rank: observed.role.rank(),
                occurred_at: envelope.occurred_at,
                source_ref,
            });
        }
        state
    }

    fn freshness(&self, state: &ContactDirectoryView) -> Freshness {
        state.freshness.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::EventStore;
    use crate::projection::rebuild_one;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn observed(email: &str, name: &str, role: ContactRole, secs: i64, source: &str) -> EventEnvelope {
        ContactObserved {
            email: email.into(),
            display_name: Some(name.into()),
            role,
            source_ref: source.into(),
        }
        .to_envelope(at(secs))
        .expect("encode should succeed")
    }

    fn fold(events: &[EventEnvelope]) -> ContactDirectoryView {
        let def = ContactDirectory;
        events.iter().fold(def.init(), |s, e| def.apply(s, e))
    }

    #[test]
    fn organizer_name_wins_over_earlier_attendee_name() {
        let events = vec![
            observed("Ann@Example.com", "ann", ContactRole::Attendee, 100, "cal:1"),
            observed("ann@example.com", "Ann Smith", ContactRole::Organizer, 200, "cal:2"),
        ];
        let view = fold(&events);
        let ann = view.get("ANN@example.com").expect("contact should exist");
        assert_eq!(ann.display_name.value().map(String::as_str), Some("Ann Smith"));
        assert_eq!(ann.roles.len(), 2);
        assert_eq!(ann.sources.len(), 2);
        assert_eq!(ann.first_seen.timestamp(), 100);
    }

    #[test]
    fn merge_is_independent_of_interleaving() {
        let events = vec![
            observed("bo@x.io", "Bo", ContactRole::Attendee, 300, "cal:3"),
            observed("bo@x.io", "Bob", ContactRole::Attendee, 100, "cal:9"),
            observed("bo@x.io", "Robert", ContactRole::Attendee, 100, "cal:1"),
        ];
        let forward = fold(&events);
        let mut reversed = events.clone();
        reversed.reverse();
        let backward = fold(&reversed);

        let f = forward.get("bo@x.io").expect("contact should exist");
        let b = backward.get("bo@x.io").expect("contact should exist");
        assert_eq!(f.display_name, b.display_name);
        assert_eq!(f.display_name.value().map(String::as_str), Some("Robert"));
    }

    #[test]
    fn sightings_in_different_records_get_distinct_ids() {
        let first = observed("cy@x.io", "Cy", ContactRole::Attendee, 200, "cal:2");
        let second = observed("cy@x.io", "Cy", ContactRole::Attendee, 100, "cal:1");
        assert_ne!(first.event_id, second.event_id);
        assert_eq!(
            first.event_id,
            observed("cy@x.io", "Cy", ContactRole::Attendee, 900, "cal:2").event_id
        );
    }

    #[tokio::test]
    async fn stored_sightings_merge_regardless_of_arrival_order() {
        let sightings = [
            observed("cy@x.io", "Cy", ContactRole::Attendee, 200, "cal:2"),
            observed("cy@x.io", "Cy", ContactRole::Attendee, 100, "cal:1"),
        ];
        let mut views = Vec::new();
        for order in [[0, 1], [1, 0]] {
            let tmp = TempDir::new().expect("failed to create temp dir");
            let store = EventStore::open(tmp.path().join("events.jsonl"), false)
                .await
                .expect("open should succeed");
            for i in order {
                let result = store.append(&sightings[i]).await.expect("append should succeed");
                assert!(result.is_appended());
            }
            let projection = rebuild_one(&ContactDirectory, &store)
                .await
                .expect("rebuild should succeed");
            let cy = projection.data.get("cy@x.io").expect("contact should exist").clone();
            views.push(cy);
        }
        assert_eq!(views[0].sources.len(), 2);
        assert_eq!(views[0].first_seen.timestamp(), 100);
        assert_eq!(views[0].sources, views[1].sources);
        assert_eq!(views[0].first_seen, views[1].first_seen);
        assert_eq!(views[0].display_name, views[1].display_name);
    }

    #[test]
    fn malformed_payload_is_skipped() {
        let bad = EventEnvelope::new(CONTACT_OBSERVED, json!({"role": "organizer"}));
        let view = fold(&[bad]);
        assert!(view.contacts.is_empty());
    }
}
