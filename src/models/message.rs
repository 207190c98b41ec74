//! Flow message envelope.
//!
//! The host runtime owns the message format; this type only knows the few
//! fields the bridge reads or writes (`payload`, `query`, `error`, `_msgid`
//! and the configured output field) and carries everything else through
//! untouched.

use crate::error::{BridgeError, BridgeResult, ErrorRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const PAYLOAD_FIELD: &str = "payload";
pub const QUERY_FIELD: &str = "query";
pub const ERROR_FIELD: &str = "error";
pub const MSG_ID_FIELD: &str = "_msgid";

/// A flow message: a JSON object passed between nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowMessage(serde_json::Map<String, JsonValue>);

impl FlowMessage {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message carrying only a payload.
    pub fn with_payload(payload: impl Into<JsonValue>) -> Self {
        let mut msg = Self::new();
        msg.set(PAYLOAD_FIELD, payload.into());
        msg
    }

    /// Get a field.
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    /// Set a field, replacing any previous value.
    pub fn set(&mut self, field: impl Into<String>, value: JsonValue) {
        self.0.insert(field.into(), value);
    }

    pub fn payload(&self) -> Option<&JsonValue> {
        self.get(PAYLOAD_FIELD)
    }

    pub fn error(&self) -> Option<&JsonValue> {
        self.get(ERROR_FIELD)
    }

    /// Remove a stale `error` left by an upstream node.
    pub fn clear_error(&mut self) -> Option<JsonValue> {
        self.0.remove(ERROR_FIELD)
    }

    /// Attach a structured error record.
    pub fn set_error(&mut self, record: &ErrorRecord) {
        self.set(ERROR_FIELD, record.to_json());
    }

    /// The `query` field, when it holds non-blank text.
    pub fn query_text(&self) -> Option<&str> {
        non_blank(self.get(QUERY_FIELD))
    }

    /// The payload, when it holds non-blank text.
    pub fn payload_text(&self) -> Option<&str> {
        non_blank(self.payload())
    }

    pub fn set_query(&mut self, query: impl Into<String>) {
        self.set(QUERY_FIELD, JsonValue::String(query.into()));
    }

    /// Message id, assigning a fresh one when the host did not.
    pub fn ensure_msg_id(&mut self) -> String {
        if let Some(id) = self.get(MSG_ID_FIELD).and_then(JsonValue::as_str) {
            return id.to_string();
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.set(MSG_ID_FIELD, JsonValue::String(id.clone()));
        id
    }
}

impl TryFrom<JsonValue> for FlowMessage {
    type Error = BridgeError;

    fn try_from(value: JsonValue) -> BridgeResult<Self> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            other => Err(BridgeError::message(format!(
                "Inbound message must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

fn non_blank(value: Option<&JsonValue>) -> Option<&str> {
    value
        .and_then(JsonValue::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
