//! JSON-RPC 2.0 wire representation.
//!
//! The multiplexer forwards most messages without understanding them, so the
//! wire type is a raw JSON object ([`Envelope`]) rather than a typed struct:
//! fields the broker never looks at survive re-serialization untouched, and
//! clients are free to attach extra keys. Only `id`, `method`, `params`,
//! `result` and `error` are ever inspected.
//!
//! Structurally a message is exactly one of:
//! - **request** — has `method` and `id` (flows either direction; the agent
//!   initiates these for permission prompts and similar reverse calls);
//! - **reply** — has `id` and `result` or `error`, no `method`;
//! - **notification** — has `method` but no `id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A parsed JSON-RPC message, held as the raw JSON object it arrived as.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    fields: Map<String, Value>,
}

/// Why a line failed to decode into an [`Envelope`].
#[derive(Debug)]
pub enum DecodeError {
    /// The line was not valid JSON.
    Parse(serde_json::Error),
    /// The line was valid JSON but not an object.
    NotAnObject,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Parse(e) => write!(f, "invalid JSON: {e}"),
            DecodeError::NotAnObject => write!(f, "message is not a JSON object"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Envelope {
    /// Decode one framed line.
    pub fn from_line(line: &str) -> Result<Self, DecodeError> {
        match serde_json::from_str::<Value>(line).map_err(DecodeError::Parse)? {
            Value::Object(fields) => Ok(Self { fields }),
            _ => Err(DecodeError::NotAnObject),
        }
    }

    /// Build a success reply: `{"jsonrpc":"2.0","result":…,"id":…}`.
    pub fn reply(id: Value, result: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("jsonrpc".into(), Value::from("2.0"));
        fields.insert("result".into(), result);
        fields.insert("id".into(), id);
        Self { fields }
    }

    /// Build an error reply from a structured [`RpcError`].
    pub fn error_reply(id: Value, error: RpcError) -> Self {
        Self::error_reply_raw(id, error.into_value())
    }

    /// Build an error reply carrying an already-encoded error object
    /// (used when relaying an agent-produced error verbatim).
    pub fn error_reply_raw(id: Value, error: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("jsonrpc".into(), Value::from("2.0"));
        fields.insert("error".into(), error);
        fields.insert("id".into(), id);
        Self { fields }
    }

    pub fn id(&self) -> Option<&Value> {
        self.fields.get("id").filter(|v| !v.is_null())
    }

    pub fn method(&self) -> Option<&str> {
        self.fields.get("method").and_then(Value::as_str)
    }

    pub fn params(&self) -> Option<&Value> {
        self.fields.get("params")
    }

    pub fn result(&self) -> Option<&Value> {
        self.fields.get("result")
    }

    pub fn error(&self) -> Option<&Value> {
        self.fields.get("error")
    }

    /// A request carries both `method` and `id`.
    pub fn is_request(&self) -> bool {
        self.method().is_some() && self.id().is_some()
    }

    /// A reply carries `result` or `error` and no `method`.
    pub fn is_reply(&self) -> bool {
        self.method().is_none() && (self.result().is_some() || self.error().is_some())
    }

    /// A notification carries `method` but no `id`.
    pub fn is_notification(&self) -> bool {
        self.method().is_some() && self.id().is_none()
    }

    /// Replace the message id, leaving every other field untouched.
    pub fn set_id(&mut self, id: Value) {
        self.fields.insert("id".into(), id);
    }

    /// Serialize back to one compact line (no trailing newline).
    pub fn to_line(&self) -> String {
        match serde_json::to_string(&self.fields) {
            Ok(line) => line,
            Err(e) => {
                // Value maps always serialize; keep the stream alive if not.
                log::error!("failed to serialize message: {e}");
                "{}".to_string()
            }
        }
    }
}

/// Canonical map key for a message id.
///
/// Ids are arbitrary JSON values; serializing distinguishes `1` from `"1"`.
pub fn id_key(id: &Value) -> String {
    id.to_string()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// `-32700` — the line was not parseable JSON.
    pub fn parse_error() -> Self {
        Self {
            code: -32700,
            message: "Parse error".to_string(),
            data: None,
        }
    }

    /// `-32600` — parsed, but not a well-formed request/reply/notification.
    pub fn invalid_request() -> Self {
        Self {
            code: -32600,
            message: "Invalid Request".to_string(),
            data: None,
        }
    }

    /// `-32601` — the agent asked something and no client is attached to
    /// answer it.
    pub fn no_responder(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("No client connected to answer {method}"),
            data: None,
        }
    }

    fn into_value(self) -> Value {
        let mut m = Map::new();
        m.insert("code".into(), Value::from(self.code));
        m.insert("message".into(), Value::from(self.message));
        if let Some(data) = self.data {
            m.insert("data".into(), data);
        }
        Value::Object(m)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
