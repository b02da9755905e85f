//! JSON-RPC 2.0 message model shared by every link.
//!
//! All traffic (editor, proxies, agent and MCP bridges) is newline-delimited
//! JSON-RPC. The conductor only needs an untyped view of each message: it
//! inspects `method`, `id` and a few well-known params, and forwards the
//! rest untouched.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ConductorError;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request identifier.
///
/// `Null` is only ever produced by the conductor, for error responses to
/// requests whose id could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => write!(f, "{s:?}"),
            Id::Null => write!(f, "null"),
        }
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Number(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::String(value.to_string())
    }
}

/// Error payload of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        ErrorObject {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Any JSON-RPC message: request, notification or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// `Some(Value::Null)` for an explicit `"result": null`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Borrowed classification of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageKind<'a> {
    Request { id: &'a Id, method: &'a str },
    Notification { method: &'a str },
    Response { id: &'a Id },
    Invalid,
}

impl Message {
    fn empty() -> Self {
        Message {
            jsonrpc: jsonrpc_version(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    pub fn request(id: impl Into<Id>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message {
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Message::empty()
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message {
            method: Some(method.into()),
            params,
            ..Message::empty()
        }
    }

    /// Build a response. A successful response always carries a `result`
    /// (possibly `null`) so it stays distinguishable on the wire.
    pub fn response(id: Id, outcome: Result<Value, ErrorObject>) -> Self {
        match outcome {
            Ok(result) => Message {
                id: Some(id),
                result: Some(result),
                ..Message::empty()
            },
            Err(error) => Message {
                id: Some(id),
                error: Some(error),
                ..Message::empty()
            },
        }
    }

    pub fn error_response(id: Id, error: &ConductorError) -> Self {
        Message::response(id, Err(error.to_error_object()))
    }

    pub fn kind(&self) -> MessageKind<'_> {
        match (&self.id, &self.method) {
            (Some(id), Some(method)) => MessageKind::Request { id, method },
            (None, Some(method)) => MessageKind::Notification { method },
            (Some(id), None) if self.result.is_some() || self.error.is_some() => {
                MessageKind::Response { id }
            }
            _ => MessageKind::Invalid,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind(), MessageKind::Response { .. })
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// The outcome carried by a response.
    pub fn outcome(&self) -> Result<Value, ErrorObject> {
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(self.result.clone().unwrap_or(Value::Null)),
        }
    }

    /// The ACP `sessionId` parameter, if this message is scoped to a session.
    pub fn session_id(&self) -> Option<&str> {
        self.params.as_ref()?.get("sessionId")?.as_str()
    }

    /// Parse one wire record.
    ///
    /// A record that names a method and carries an id, but does not fit the
    /// message model (an id above `i64::MAX` or a fractional id), is reported
    /// as [`ConductorError::InvalidRequest`] so the sender can be answered.
    pub fn parse(line: &str) -> Result<Message, ConductorError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| ConductorError::protocol(format!("invalid JSON-RPC message: {e}")))?;
        let is_request = value.get("method").is_some_and(Value::is_string)
            && value.get("id").is_some_and(|id| !id.is_null());
        let message: Message = serde_json::from_value(value).map_err(|e| {
            let message = format!("invalid JSON-RPC message: {e}");
            if is_request {
                ConductorError::InvalidRequest(message)
            } else {
                ConductorError::Protocol(message)
            }
        })?;
        if message.kind() == MessageKind::Invalid {
            return Err(ConductorError::protocol(format!(
                "message is neither a request, a notification nor a response: {line}"
            )));
        }
        Ok(message)
    }

    /// Serialize to a single wire record (without the trailing newline).
    pub fn to_line(&self) -> String {
        // A `Message` only holds JSON values, so serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
