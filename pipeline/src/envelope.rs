//! Normalization of inbound message bodies.
//!
//! Upstream stages wrap messages in several shapes: an event with `detail.messages` or
//! `detail.message`, an API body with `message`, an object-created notification pointing at a
//! bucket and key, or plain text. [`normalize`] maps all of them onto [`Envelope`] so handlers
//! match on a closed set of variants.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result of attempting a structured parse of a raw body.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedBody {
    Json(Value),
    /// The body is not a JSON object or array; kept verbatim.
    Raw(String),
}

impl ParsedBody {
    /// Parses `raw` as JSON when it looks like an object or an array.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let looks_structured = (trimmed.starts_with('{') && trimmed.ends_with('}'))
            || (trimmed.starts_with('[') && trimmed.ends_with(']'));
        if looks_structured && let Ok(value) = serde_json::from_str(trimmed) {
            return ParsedBody::Json(value);
        }
        ParsedBody::Raw(raw.to_string())
    }

    pub fn into_value(self) -> Value {
        match self {
            ParsedBody::Json(value) => value,
            ParsedBody::Raw(raw) => Value::String(raw),
        }
    }
}

/// Parses `raw` and, for objects, also parses string fields that themselves hold JSON.
pub fn parse_nested(raw: &str) -> Value {
    match ParsedBody::parse(raw) {
        ParsedBody::Json(Value::Object(map)) => Value::Object(
            map.into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, ParsedBody::parse(&s).into_value()),
                    other => (k, other),
                })
                .collect(),
        ),
        other => other.into_value(),
    }
}

/// Pointer to a stored object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// A list of messages to fan out (`detail.messages`, or `detail` itself).
    Messages(Vec<Value>),
    /// A single text message (`detail.message`, `message`, `body.message`).
    Message(String),
    /// A reference to an object in the content store.
    Object(ObjectRef),
    /// Any other JSON document.
    Document(Value),
    /// Body that is not structured.
    Raw(String),
}

/// Maps a raw message body onto an [`Envelope`].
pub fn normalize(raw: &str) -> Envelope {
    match ParsedBody::parse(raw) {
        ParsedBody::Raw(text) => Envelope::Raw(text),
        ParsedBody::Json(value) => normalize_value(value, true),
    }
}

fn normalize_value(value: Value, unwrap_body: bool) -> Envelope {
    let mut map = match value {
        Value::Object(map) => map,
        Value::Array(messages) => return Envelope::Messages(messages),
        other => return Envelope::Document(other),
    };

    if let Some(object) = notification_object(&map) {
        return Envelope::Object(object);
    }

    if let Some(detail) = map.remove("detail") {
        return match detail {
            Value::Object(mut detail) => {
                if let Some(object) = bucket_key(&detail) {
                    Envelope::Object(object)
                } else if let Some(messages) = detail.remove("messages") {
                    Envelope::Messages(into_list(messages))
                } else if let Some(message) = detail.remove("message") {
                    Envelope::Message(text_of(message))
                } else {
                    Envelope::Messages(vec![Value::Object(detail)])
                }
            }
            other => Envelope::Messages(vec![other]),
        };
    }

    if let (Some(Value::String(bucket)), Some(Value::String(key))) =
        (map.get("bucket"), map.get("key"))
    {
        return Envelope::Object(ObjectRef {
            bucket: bucket.clone(),
            key: key.clone(),
        });
    }

    if let Some(message) = map.remove("message") {
        return Envelope::Message(text_of(message));
    }

    if unwrap_body && let Some(body) = map.get("body") {
        let inner = match body {
            Value::String(s) => ParsedBody::parse(s).into_value(),
            other => other.clone(),
        };
        match normalize_value(inner, false) {
            Envelope::Message(message) => return Envelope::Message(message),
            Envelope::Object(object) => return Envelope::Object(object),
            _ => {}
        }
    }

    Envelope::Document(Value::Object(map))
}

/// Messages carried by a bus event, unnarrowed: `detail.messages` (a single value becomes a
/// one-element list) or else the whole `detail`. `None` when `raw` has no `detail`.
pub fn event_messages(raw: &str) -> Option<Vec<Value>> {
    let ParsedBody::Json(Value::Object(mut map)) = ParsedBody::parse(raw) else {
        return None;
    };
    Some(match map.remove("detail")? {
        Value::Object(mut detail) => match detail.remove("messages") {
            Some(messages) => into_list(messages),
            None => vec![Value::Object(detail)],
        },
        other => vec![other],
    })
}

fn into_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(values) => values,
        other => vec![other],
    }
}

/// `{"Records": [{"s3": {"bucket": {"name"}, "object": {"key"}}}]}`
fn notification_object(map: &Map<String, Value>) -> Option<ObjectRef> {
    let record = map.get("Records")?.as_array()?.first()?;
    let s3 = record.get("s3")?;
    Some(ObjectRef {
        bucket: s3.get("bucket")?.get("name")?.as_str()?.to_string(),
        key: s3.get("object")?.get("key")?.as_str()?.to_string(),
    })
}

/// `{"bucket": {"name"}, "object": {"key"}}`
fn bucket_key(detail: &Map<String, Value>) -> Option<ObjectRef> {
    Some(ObjectRef {
        bucket: detail.get("bucket")?.get("name")?.as_str()?.to_string(),
        key: detail.get("object")?.get("key")?.as_str()?.to_string(),
    })
}

fn text_of(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
