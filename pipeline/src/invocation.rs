//! Invocation envelope exchanged with the invoker.
//!
//! ```json
//! {"records": [{"id": "m1", "body": "{\"message\": \"hi\"}"}]}
//! ```
//!
//! A handler answers either with its own success object or with the records that must be
//! redelivered: `{"batchItemFailures": [{"itemIdentifier": "m1"}]}`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct InvocationEnvelope {
    #[serde(default)]
    pub records: Vec<InboundRecord>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct InboundRecord {
    #[serde(alias = "messageId")]
    pub id: String,
    /// Raw record body. A JSON value in this position is kept in its serialized form.
    #[serde(default, alias = "rawBody", deserialize_with = "body_text")]
    pub body: String,
}

impl InboundRecord {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }
}

fn body_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InvocationResponse {
    Completed(Value),
    PartialFailure {
        #[serde(rename = "batchItemFailures")]
        batch_item_failures: Vec<BatchItemFailure>,
    },
}

impl InvocationResponse {
    /// `success` when no record failed, otherwise the failed record ids in input order.
    pub fn from_failed_records(failed: Vec<String>, success: Value) -> Self {
        if failed.is_empty() {
            return InvocationResponse::Completed(success);
        }
        InvocationResponse::PartialFailure {
            batch_item_failures: failed
                .into_iter()
                .map(|item_identifier| BatchItemFailure { item_identifier })
                .collect(),
        }
    }

    /// Identifiers of the records the invoker must redeliver.
    pub fn failed_records(&self) -> Vec<&str> {
        match self {
            InvocationResponse::Completed(_) => Vec::new(),
            InvocationResponse::PartialFailure {
                batch_item_failures,
            } => batch_item_failures
                .iter()
                .map(|f| f.item_identifier.as_str())
                .collect(),
        }
    }
}
