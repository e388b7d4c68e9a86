use std::collections::HashMap;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Pub/Sub producers are inconsistent about trailing `=`; accept both.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A decoded Cloud Logging `LogEntry`.
pub type LogEntry = Map<String, Value>;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("push body is not valid JSON: {0}")]
    Body(#[source] serde_json::Error),

    #[error("push body has no `message` object")]
    MissingMessage,

    #[error("Pub/Sub message has no `data` field")]
    MissingData,

    #[error("message data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decoded data is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("decoded data is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

#[derive(Deserialize)]
struct PushBody {
    message: PushMessage,
    subscription: Option<String>,
    #[serde(rename = "deliveryAttempt")]
    delivery_attempt: Option<u32>,
}

#[derive(Deserialize)]
struct PushMessage {
    data: Option<String>,
    #[serde(rename = "messageId", alias = "message_id")]
    message_id: Option<String>,
    #[serde(rename = "publishTime", alias = "publish_time")]
    publish_time: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

/// One inbound unit of work, as handed over by the push subscription.
#[derive(Debug, Clone)]
pub struct DeliveryEnvelope {
    /// Base64 text of the embedded log entry.
    pub payload: String,
    pub message_id: Option<String>,
    pub publish_time: Option<String>,
    pub attributes: HashMap<String, String>,
    pub subscription: Option<String>,
    /// Only present when the subscription has a dead-letter policy.
    pub delivery_attempt: Option<u32>,
}

impl DeliveryEnvelope {
    /// Accepts either a raw Pub/Sub push body or a structured CloudEvent
    /// whose `data` wraps one.
    pub fn from_push_body(body: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(body).map_err(EnvelopeError::Body)?;

        let push = match value {
            Value::Object(mut obj) if !obj.contains_key("message") => {
                obj.remove("data").ok_or(EnvelopeError::MissingMessage)?
            }
            other => other,
        };
        if !push.get("message").is_some_and(Value::is_object) {
            return Err(EnvelopeError::MissingMessage);
        }

        let push: PushBody = serde_json::from_value(push).map_err(EnvelopeError::Body)?;
        let payload = push
            .message
            .data
            .filter(|d| !d.trim().is_empty())
            .ok_or(EnvelopeError::MissingData)?;

        Ok(Self {
            payload,
            message_id: push.message.message_id,
            publish_time: push.message.publish_time,
            attributes: push.message.attributes,
            subscription: push.subscription,
            delivery_attempt: push.delivery_attempt,
        })
    }

    /// Base64-decode and JSON-parse the embedded log entry.
    pub fn decode(&self) -> Result<LogEntry, EnvelopeError> {
        let bytes = PAYLOAD_ENGINE.decode(self.payload.trim())?;
        match serde_json::from_slice(&bytes).map_err(EnvelopeError::Json)? {
            Value::Object(entry) => Ok(entry),
            other => Err(EnvelopeError::NotAnObject(json_kind(&other))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
