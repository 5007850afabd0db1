//! CloudEvents envelope codec.
//!
//! Inbound: broker payloads are parsed into an immutable [`Envelope`] and
//! checked for expiration before they reach either delivery path.
//! Outbound: raw publish payloads are wrapped in a CloudEvents 1.0 envelope
//! (or an application-built CloudEvent is stamped with routing fields).

mod content_type;

use std::collections::HashMap;

use base64::prelude::*;
use chrono::{DateTime, TimeDelta, Utc};
use cloudevents::{EventBuilder, EventBuilderV10};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::bus::Feature;
use crate::proto::TopicEventRequest;

pub use content_type::{
    is_binary_content_type, is_cloud_event_content_type, is_json_content_type,
    is_string_content_type, CLOUD_EVENT_CONTENT_TYPE,
};

pub const ID_FIELD: &str = "id";
pub const SOURCE_FIELD: &str = "source";
pub const TYPE_FIELD: &str = "type";
pub const SPEC_VERSION_FIELD: &str = "specversion";
pub const DATA_CONTENT_TYPE_FIELD: &str = "datacontenttype";
pub const DATA_FIELD: &str = "data";
pub const DATA_BASE64_FIELD: &str = "data_base64";
pub const EXPIRATION_FIELD: &str = "expiration";
pub const TOPIC_FIELD: &str = "topic";
pub const PUBSUB_NAME_FIELD: &str = "pubsubname";

pub const CLOUD_EVENTS_SPEC_VERSION: &str = "1.0";
pub const DEFAULT_CLOUD_EVENT_SOURCE: &str = "courier";
pub const DEFAULT_CLOUD_EVENT_TYPE: &str = "com.courier.event.sent";
/// Content type assumed when a publisher does not name one.
pub const DEFAULT_PUBLISH_CONTENT_TYPE: &str = "text/plain";

/// Publish metadata key carrying a message time-to-live in seconds.
pub const TTL_METADATA_KEY: &str = "ttlInSeconds";

/// Errors raised while decoding or building envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' must be a string")]
    NotAString(&'static str),

    #[error("event carries neither 'data' nor 'data_base64'")]
    MissingData,

    #[error("unable to base64 decode 'data_base64': {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("cannot create cloudevent: {0}")]
    Build(String),
}

/// Canonical, broker-independent representation of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub spec_version: String,
    /// Empty when the event did not declare one.
    pub data_content_type: String,
    pub data: Vec<u8>,
    pub topic: String,
    pub pubsub_name: String,
    /// Broker metadata forwarded to the application.
    pub metadata: HashMap<String, String>,
}

impl Envelope {
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

impl From<Envelope> for TopicEventRequest {
    fn from(envelope: Envelope) -> Self {
        TopicEventRequest {
            id: envelope.id,
            source: envelope.source,
            r#type: envelope.event_type,
            spec_version: envelope.spec_version,
            data_content_type: envelope.data_content_type,
            data: envelope.data,
            topic: envelope.topic,
            pubsub_name: envelope.pubsub_name,
            metadata: envelope.metadata,
        }
    }
}

/// Outcome of decoding a broker payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(Envelope),
    /// The event's expiration has passed; it must be acked without delivery.
    Expired { id: String, expired_at: DateTime<Utc> },
}

/// Decode a broker payload against the current wall clock.
pub fn decode(raw: &[u8], topic: &str, pubsub_name: &str) -> Result<Decoded, CodecError> {
    decode_at(raw, topic, pubsub_name, Utc::now())
}

/// Decode a broker payload, judging expiration against `now`.
pub fn decode_at(
    raw: &[u8],
    topic: &str,
    pubsub_name: &str,
    now: DateTime<Utc>,
) -> Result<Decoded, CodecError> {
    let event = parse_object(raw)?;

    let id = required_str(&event, ID_FIELD)?;
    let source = required_str(&event, SOURCE_FIELD)?;
    let event_type = required_str(&event, TYPE_FIELD)?;
    let spec_version = required_str(&event, SPEC_VERSION_FIELD)?;
    let data_content_type = optional_str(&event, DATA_CONTENT_TYPE_FIELD)?.unwrap_or_default();
    let data = resolve_data(&event, &data_content_type)?;

    if let Some(expired_at) = expiration(&event).filter(|expires| *expires < now) {
        return Ok(Decoded::Expired { id, expired_at });
    }

    Ok(Decoded::Event(Envelope {
        id,
        source,
        event_type,
        spec_version,
        data_content_type,
        data,
        topic: topic.to_string(),
        pubsub_name: pubsub_name.to_string(),
        metadata: HashMap::new(),
    }))
}

/// Wrap a raw publish payload in a CloudEvents 1.0 envelope.
pub fn new_cloud_event(
    data: &[u8],
    content_type: &str,
    topic: &str,
    pubsub_name: &str,
) -> Result<Map<String, Value>, CodecError> {
    let content_type = if content_type.is_empty() {
        DEFAULT_PUBLISH_CONTENT_TYPE
    } else {
        content_type
    };

    let builder = EventBuilderV10::new()
        .id(Uuid::new_v4().to_string())
        .source(DEFAULT_CLOUD_EVENT_SOURCE)
        .ty(DEFAULT_CLOUD_EVENT_TYPE)
        .extension(TOPIC_FIELD, topic)
        .extension(PUBSUB_NAME_FIELD, pubsub_name);

    let builder = if is_json_content_type(content_type) {
        match serde_json::from_slice::<Value>(data) {
            Ok(json) => builder.data(content_type, json),
            Err(_) => builder.data(content_type, String::from_utf8_lossy(data).into_owned()),
        }
    } else if is_binary_content_type(content_type) {
        builder.data(content_type, data.to_vec())
    } else {
        builder.data(content_type, String::from_utf8_lossy(data).into_owned())
    };

    let event = builder
        .build()
        .map_err(|e| CodecError::Build(e.to_string()))?;

    match serde_json::to_value(&event)? {
        Value::Object(map) => Ok(map),
        _ => Err(CodecError::NotAnObject),
    }
}

/// Accept an application-built CloudEvent and stamp routing fields on it.
pub fn from_cloud_event(
    data: &[u8],
    topic: &str,
    pubsub_name: &str,
) -> Result<Map<String, Value>, CodecError> {
    let mut event = parse_object(data)?;
    if !event.get(ID_FIELD).is_some_and(Value::is_string) {
        event.insert(ID_FIELD.to_string(), Value::String(Uuid::new_v4().to_string()));
    }
    event
        .entry(SPEC_VERSION_FIELD)
        .or_insert_with(|| Value::String(CLOUD_EVENTS_SPEC_VERSION.to_string()));
    event.insert(TOPIC_FIELD.to_string(), Value::String(topic.to_string()));
    event.insert(
        PUBSUB_NAME_FIELD.to_string(),
        Value::String(pubsub_name.to_string()),
    );
    Ok(event)
}

/// Apply publish metadata to an outbound envelope.
///
/// Components with native message TTL expire messages themselves, so the
/// envelope is only stamped when the component lacks it.
pub fn apply_metadata(
    event: &mut Map<String, Value>,
    features: &[Feature],
    metadata: &HashMap<String, String>,
) {
    apply_metadata_at(event, features, metadata, Utc::now())
}

pub fn apply_metadata_at(
    event: &mut Map<String, Value>,
    features: &[Feature],
    metadata: &HashMap<String, String>,
    now: DateTime<Utc>,
) {
    if features.contains(&Feature::MessageTtl) {
        return;
    }
    let expires = metadata
        .get(TTL_METADATA_KEY)
        .and_then(|ttl| ttl.trim().parse::<i64>().ok())
        .filter(|ttl| *ttl > 0)
        .and_then(TimeDelta::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl));
    if let Some(expires) = expires {
        event.insert(
            EXPIRATION_FIELD.to_string(),
            Value::String(expires.to_rfc3339()),
        );
    }
}

/// Serialize an envelope for the broker.
pub fn encode(event: Map<String, Value>) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(&Value::Object(event))?)
}

fn parse_object(raw: &[u8]) -> Result<Map<String, Value>, CodecError> {
    match serde_json::from_slice::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(CodecError::NotAnObject),
    }
}

/// A field holding JSON `null` counts as absent.
fn present<'a>(event: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    event.get(field).filter(|value| !value.is_null())
}

fn optional_str(
    event: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, CodecError> {
    match present(event, field) {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(CodecError::NotAString(field)),
    }
}

fn required_str(event: &Map<String, Value>, field: &'static str) -> Result<String, CodecError> {
    optional_str(event, field)?.ok_or(CodecError::MissingField(field))
}

/// Payload bytes of a decoded event.
///
/// Follows the CloudEvents JSON format rather than leaving the payload
/// empty: an absent `datacontenttype` defaults to `application/json`, so
/// `data` is re-serialized as JSON, and a string `data` under any other
/// non-JSON content type is passed through as its raw bytes.
fn resolve_data(event: &Map<String, Value>, content_type: &str) -> Result<Vec<u8>, CodecError> {
    if let Some(encoded) = present(event, DATA_BASE64_FIELD) {
        let Value::String(encoded) = encoded else {
            return Err(CodecError::NotAString(DATA_BASE64_FIELD));
        };
        return Ok(BASE64_STANDARD.decode(encoded)?);
    }

    let data = present(event, DATA_FIELD).ok_or(CodecError::MissingData)?;
    if content_type.is_empty() || is_json_content_type(content_type) {
        return Ok(serde_json::to_vec(data)?);
    }
    match data {
        Value::String(text) => Ok(text.as_bytes().to_vec()),
        other => Ok(serde_json::to_vec(other)?),
    }
}

fn expiration(event: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let raw = event.get(EXPIRATION_FIELD)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|expires| expires.with_timezone(&Utc))
}
