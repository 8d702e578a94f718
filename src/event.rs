//! Event encoding, decoding, and the durable record types shared by the
//! actor and the event log backends.
//!
//! No I/O happens here. Domain events travel through the log as an
//! adjacently tagged pair: a `"type"` tag (stored as
//! [`RecordedEvent::event_type`]) and a `"data"` payload.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::log::Epoch;

/// Infrastructure metadata stamped on every event written by this crate.
///
/// Makes each record self-describing: a reader of the raw log can recover
/// which entity an event belongs to without consulting the directory layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Aggregate type name (e.g. "todo").
    pub aggregate_type: String,
    /// Entity identifier.
    pub instance_id: String,
    /// Caller identity from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation id from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Extra metadata from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// An event that has been decided but not yet appended.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Fresh UUID v4 identifying this event.
    pub event_id: Uuid,
    /// Variant tag of the domain event (e.g. "Created").
    pub event_type: String,
    /// The `"data"` half of the tagged domain event, `Null` for unit variants.
    pub payload: Value,
    /// Identity and audit metadata.
    pub metadata: EventMetadata,
}

/// A durable event as returned by [`EventLog::read`](crate::EventLog::read).
///
/// One line of a stream's log. `sequence` starts at 1 and increases by
/// exactly one per append within a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Position within the stream, starting at 1.
    pub sequence: u64,
    /// Client-assigned event id.
    pub event_id: Uuid,
    /// Variant tag of the domain event.
    pub event_type: String,
    /// Domain event payload.
    #[serde(default)]
    pub payload: Value,
    /// Identity and audit metadata.
    pub metadata: EventMetadata,
    /// Fencing token of the writer that appended this record.
    pub epoch: Epoch,
    /// Append time, Unix epoch milliseconds.
    pub recorded_at: u64,
}

impl RecordedEvent {
    /// Turn a proposal into the record stored at `sequence`.
    pub(crate) fn from_proposed(proposed: ProposedEvent, sequence: u64, epoch: Epoch) -> Self {
        Self {
            sequence,
            event_id: proposed.event_id,
            event_type: proposed.event_type,
            payload: proposed.payload,
            metadata: proposed.metadata,
            epoch,
            recorded_at: now_millis(),
        }
    }
}

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
fn now_millis() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Encode a domain event into a [`ProposedEvent`] ready to append.
///
/// The domain event must use `#[serde(tag = "type", content = "data")]`.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or does
/// not serialize to an adjacently tagged object.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
    ctx: &CommandContext,
    instance_id: &str,
) -> serde_json::Result<ProposedEvent> {
    use serde::ser::Error as _;

    let value = serde_json::to_value(event)?;
    let Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to an adjacently tagged object",
        ));
    };
    let event_type = match obj.remove("type") {
        Some(Value::String(tag)) => tag,
        _ => {
            return Err(serde_json::Error::custom(
                "domain event is missing a string \"type\" tag",
            ));
        }
    };
    // Unit variants carry no "data" key.
    let payload = obj.remove("data").unwrap_or(Value::Null);

    let extra = match &ctx.metadata {
        None => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(Value::Object(map)) => Some(Value::Object(map.clone())),
        Some(other) => Some(serde_json::json!({ "context": other })),
    };

    Ok(ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type,
        payload,
        metadata: EventMetadata {
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            instance_id: instance_id.to_string(),
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
            extra,
        },
    })
}

/// Decode a durable record back into the aggregate's domain event.
///
/// Returns `None` for unknown or malformed event types so that older code
/// can replay streams written by newer code.
pub fn decode_domain_event<A: Aggregate>(record: &RecordedEvent) -> Option<A::DomainEvent> {
    let tagged = if record.payload.is_null() {
        serde_json::json!({ "type": record.event_type })
    } else {
        serde_json::json!({ "type": record.event_type, "data": record.payload })
    };
    serde_json::from_value(tagged).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::todo::{Todo, TodoEvent};
    use serde_json::json;

    fn created() -> TodoEvent {
        TodoEvent::Created {
            title: "Buy milk".into(),
            description: Some("2 litres".into()),
        }
    }

    #[test]
    fn encode_extracts_tag_and_payload() {
        let proposed =
            encode_domain_event::<Todo>(&created(), &CommandContext::default(), "t-1")
                .expect("encode should succeed");

        assert_eq!(proposed.event_type, "Created");
        assert_eq!(proposed.payload["title"], "Buy milk");
        assert_eq!(proposed.metadata.aggregate_type, "todo");
        assert_eq!(proposed.metadata.instance_id, "t-1");
        assert_eq!(proposed.event_id.get_version(), Some(uuid::Version::Random));
    }

    #[test]
    fn encode_unit_variant_has_null_payload() {
        let proposed =
            encode_domain_event::<Todo>(&TodoEvent::Completed, &CommandContext::default(), "t-1")
                .expect("encode should succeed");
        assert_eq!(proposed.event_type, "Completed");
        assert!(proposed.payload.is_null());
    }

    #[test]
    fn encode_copies_context_into_metadata() {
        let ctx = CommandContext::default()
            .with_actor("u1")
            .with_correlation_id("c1")
            .with_metadata(json!("raw"));
        let proposed = encode_domain_event::<Todo>(&TodoEvent::Deleted, &ctx, "t-1")
            .expect("encode should succeed");

        assert_eq!(proposed.metadata.actor.as_deref(), Some("u1"));
        assert_eq!(proposed.metadata.correlation_id.as_deref(), Some("c1"));
        assert_eq!(proposed.metadata.extra, Some(json!({"context": "raw"})));
    }

    #[test]
    fn metadata_omits_absent_fields() {
        let proposed =
            encode_domain_event::<Todo>(&TodoEvent::Deleted, &CommandContext::default(), "t-1")
                .expect("encode should succeed");
        let text = serde_json::to_string(&proposed.metadata).expect("serialize");
        assert!(!text.contains("actor"));
        assert!(!text.contains("correlation_id"));
        assert!(!text.contains("extra"));
    }

    #[test]
    fn decode_reverses_encode() {
        let proposed =
            encode_domain_event::<Todo>(&created(), &CommandContext::default(), "t-1")
                .expect("encode should succeed");
        let record = RecordedEvent::from_proposed(proposed, 1, Epoch::ZERO);

        assert_eq!(decode_domain_event::<Todo>(&record), Some(created()));
    }

    #[test]
    fn decode_unknown_type_is_none() {
        let proposed =
            encode_domain_event::<Todo>(&TodoEvent::Completed, &CommandContext::default(), "t-1")
                .expect("encode should succeed");
        let mut record = RecordedEvent::from_proposed(proposed, 1, Epoch::ZERO);
        record.event_type = "Archived".into();

        assert_eq!(decode_domain_event::<Todo>(&record), None);
    }
}
