//! Event envelopes, deterministic event ids, and the tagged domain-event codec.
//!
//! An event's id is a pure function of its `event_type` and `payload`, so
//! any two producers that derive the same logical event agree on its id.
//! That is what lets [`EventStore::append`](crate::EventStore::append)
//! treat a resubmitted event as a no-op.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::command::CommandContext;
use crate::error::{LedgerError, Result};

/// Fixed namespace UUID for event id derivation.
///
/// Every event id is a UUID v5 derived from this namespace and the
/// canonical `"{event_type}\n{payload}"` string.
const EVENT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x2d, 0x91, 0x0e, 0x58, 0xa4, 0x4f, 0x3c, 0x9e, 0x17, 0xd2, 0x44, 0x0b, 0x7a, 0xc1, 0x35,
]);

/// Current envelope layout version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Payload schema version stamped on events that do not specify one.
pub const DEFAULT_PAYLOAD_SCHEMA_VERSION: u32 = 1;

/// Derive the deterministic id of an event.
///
/// The payload is rendered as canonical JSON (object keys sorted at every
/// depth), so two payloads that differ only in key order share an id.
///
/// # Examples
///
/// ```
/// use ledgerfold::derive_event_id;
/// use serde_json::json;
///
/// let a = derive_event_id("task.created", &json!({"task_id": "T1", "bucket": "today"}));
/// let b = derive_event_id("task.created", &json!({"bucket": "today", "task_id": "T1"}));
/// assert_eq!(a, b);
/// ```
pub fn derive_event_id(event_type: &str, payload: &Value) -> Uuid {
    let mut name = String::with_capacity(event_type.len() + 64);
    name.push_str(event_type);
    name.push('\n');
    write_canonical(payload, &mut name);
    Uuid::new_v5(&EVENT_NAMESPACE, name.as_bytes())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// One immutable record in the [`EventStore`](crate::EventStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Deterministic id, see [`derive_event_id`].
    pub event_id: Uuid,
    /// Event type tag (e.g. `"task.completed"`).
    pub event_type: String,
    /// JSON payload.
    pub payload: Value,
    /// When the fact happened in the domain.
    pub occurred_at: DateTime<Utc>,
    /// When the envelope was built for ingestion.
    pub ingested_at: DateTime<Utc>,
    /// Correlation id shared by every event of one request.
    pub correlation_id: String,
    /// Id of the command (or event) that caused this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Who caused the event.
    pub actor: String,
    /// Reference to the external record this event was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    /// Envelope layout version.
    pub envelope_version: u32,
    /// Version of the payload schema for `event_type`.
    pub payload_schema_version: u32,
}

impl EventEnvelope {
    /// Build an envelope whose id is derived from `event_type` and `payload`.
    ///
    /// `occurred_at` and `ingested_at` default to now; the correlation id
    /// defaults to the event id and the actor to `"system"`.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        let event_type = event_type.into();
        let event_id = derive_event_id(&event_type, &payload);
        let now = Utc::now();
        Self {
            event_id,
            event_type,
            payload,
            occurred_at: now,
            ingested_at: now,
            correlation_id: event_id.to_string(),
            causation_id: None,
            actor: "system".to_owned(),
            source_ref: None,
            envelope_version: ENVELOPE_VERSION,
            payload_schema_version: DEFAULT_PAYLOAD_SCHEMA_VERSION,
        }
    }

    /// Set when the fact happened.
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }

    /// Set the actor.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
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

    /// Set the external source reference.
    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    /// Set the payload schema version.
    pub fn with_payload_schema_version(mut self, version: u32) -> Self {
        self.payload_schema_version = version;
        self
    }

    /// Decode the payload into a typed domain event.
    ///
    /// Returns `None` for event types the target enum does not know, which
    /// reducers treat as "skip" for forward compatibility.
    pub fn decode<E: DeserializeOwned>(&self) -> Option<E> {
        decode_tagged(&self.event_type, &self.payload).ok()
    }
}

/// Split an adjacently tagged value (`{"type": ..., "data": ...}`) into its
/// tag and payload.
///
/// Fieldless variants have no `"data"` field; their payload is `null`.
///
/// # Errors
///
/// Returns [`LedgerError::Serialization`] if `value` does not serialize to
/// an object with a string `"type"` field.
pub fn encode_tagged<T: Serialize>(value: &T) -> Result<(String, Value)> {
    let value = serde_json::to_value(value)?;
    let Value::Object(mut obj) = value else {
        return Err(not_tagged("expected an adjacently tagged object"));
    };
    let tag = match obj.remove("type") {
        Some(Value::String(tag)) => tag,
        _ => return Err(not_tagged("missing string \"type\" field")),
    };
    let data = obj.remove("data").unwrap_or(Value::Null);
    Ok((tag, data))
}

/// Rebuild an adjacently tagged value from a tag and payload and decode it.
///
/// # Errors
///
/// Returns [`LedgerError::Serialization`] if the tag is unknown to `T` or
/// the payload does not match the variant's shape.
pub fn decode_tagged<T: DeserializeOwned>(tag: &str, payload: &Value) -> Result<T> {
    let tagged = if payload.is_null() {
        serde_json::json!({ "type": tag })
    } else {
        serde_json::json!({ "type": tag, "data": payload })
    };
    Ok(serde_json::from_value(tagged)?)
}

fn not_tagged(msg: &str) -> LedgerError {
    LedgerError::Serialization(<serde_json::Error as serde::ser::Error>::custom(msg))
}

/// Wrap a typed domain event in an envelope carrying the command's metadata.
///
/// `occurred_at` is the command's `requested_at`, the causation id is the
/// command id, and the target reference becomes the `source_ref`.
pub fn encode_domain_event<E: Serialize>(event: &E, ctx: &CommandContext) -> Result<EventEnvelope> {
    let (event_type, payload) = encode_tagged(event)?;
    let mut envelope = EventEnvelope::new(event_type, payload)
        .occurred_at(ctx.requested_at)
        .with_actor(ctx.actor.clone())
        .with_correlation_id(ctx.correlation_id.clone())
        .with_causation_id(ctx.command_id.clone());
    if !ctx.target_ref.is_empty() {
        envelope = envelope.with_source_ref(ctx.target_ref.clone());
    }
    Ok(envelope)
}
