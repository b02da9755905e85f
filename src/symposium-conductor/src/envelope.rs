//! The proxy successor protocol and the MCP-over-ACP bridge operations.
//!
//! A proxy never talks to its successor directly. It hands the conductor an
//! *outbound* envelope and the conductor delivers the unwrapped message to
//! the next component. Messages travelling the other way reach the proxy as
//! *inbound* envelopes. Each envelope's params are the inner message
//! `{ "method": ..., "params": ... }`; the envelope itself carries the
//! request id when the inner message is a request.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ConductorError;
use crate::jsonrpc::{Id, Message, MessageKind};

/// Outbound request: a component asks the conductor to send a request to its successor.
pub const SEND_REQUEST: &str = "_proxy/successor/send/request";
/// Outbound notification for the successor.
pub const SEND_NOTIFICATION: &str = "_proxy/successor/send/notification";
/// Inbound request delivered to a component from its successor.
pub const RECEIVE_REQUEST: &str = "_proxy/successor/receive/request";
/// Inbound notification delivered to a component from its successor.
pub const RECEIVE_NOTIFICATION: &str = "_proxy/successor/receive/notification";

/// MCP traffic from the agent (the MCP client) to a proxy's MCP server.
pub const MCP_CLIENT_TO_SERVER: &str = "_mcp/client_to_server";
/// MCP traffic from a proxy's MCP server back to the agent.
pub const MCP_SERVER_TO_CLIENT: &str = "_mcp/server_to_client";
/// Sent to the owning proxy when a bridge connection goes away.
pub const MCP_DISCONNECT: &str = "_mcp/disconnect";

/// The message carried inside an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerMessage {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl InnerMessage {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        InnerMessage {
            method: method.into(),
            params,
        }
    }

    /// Strip the id off a request or notification.
    pub fn from_message(message: &Message) -> Option<InnerMessage> {
        let method = message.method.clone()?;
        Some(InnerMessage {
            method,
            params: message.params.clone(),
        })
    }

    pub fn into_request(self, id: Id) -> Message {
        Message::request(id, self.method, self.params)
    }

    pub fn into_notification(self) -> Message {
        Message::notification(self.method, self.params)
    }

    /// Rebuild a request when `id` is present, a notification otherwise.
    pub fn into_message(self, id: Option<Id>) -> Message {
        match id {
            Some(id) => self.into_request(id),
            None => self.into_notification(),
        }
    }

    fn parse(params: Option<&Value>) -> Result<InnerMessage, ConductorError> {
        let params = params.ok_or_else(|| ConductorError::protocol("envelope without payload"))?;
        let inner: InnerMessage = serde_json::from_value(params.clone())
            .map_err(|e| ConductorError::protocol(format!("malformed envelope payload: {e}")))?;
        if inner.method.is_empty() {
            return Err(ConductorError::protocol("envelope payload has an empty method"));
        }
        Ok(inner)
    }

    fn to_params(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The four successor-protocol operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    SendRequest { id: Id, inner: InnerMessage },
    SendNotification { inner: InnerMessage },
    ReceiveRequest { id: Id, inner: InnerMessage },
    ReceiveNotification { inner: InnerMessage },
}

impl Envelope {
    /// Recognize an envelope.
    ///
    /// Returns `Ok(None)` for ordinary messages and an error when the method
    /// names an envelope but the shape is wrong (missing payload, a request
    /// envelope sent as a notification or the other way around).
    pub fn parse(message: &Message) -> Result<Option<Envelope>, ConductorError> {
        let (id, method) = match message.kind() {
            MessageKind::Request { id, method } => (Some(id), method),
            MessageKind::Notification { method } => (None, method),
            MessageKind::Response { .. } | MessageKind::Invalid => return Ok(None),
        };

        let envelope = match (method, id) {
            (SEND_REQUEST, Some(id)) => Envelope::SendRequest {
                id: id.clone(),
                inner: InnerMessage::parse(message.params.as_ref())?,
            },
            (SEND_NOTIFICATION, None) => Envelope::SendNotification {
                inner: InnerMessage::parse(message.params.as_ref())?,
            },
            (RECEIVE_REQUEST, Some(id)) => Envelope::ReceiveRequest {
                id: id.clone(),
                inner: InnerMessage::parse(message.params.as_ref())?,
            },
            (RECEIVE_NOTIFICATION, None) => Envelope::ReceiveNotification {
                inner: InnerMessage::parse(message.params.as_ref())?,
            },
            (SEND_REQUEST | RECEIVE_REQUEST, None) => {
                return Err(ConductorError::protocol(format!(
                    "`{method}` must be sent as a request"
                )))
            }
            (SEND_NOTIFICATION | RECEIVE_NOTIFICATION, Some(_)) => {
                return Err(ConductorError::protocol(format!(
                    "`{method}` must be sent as a notification"
                )))
            }
            _ => return Ok(None),
        };
        Ok(Some(envelope))
    }

    /// Wrap a message arriving from a component's successor.
    pub fn receive(id: Option<Id>, inner: InnerMessage) -> Envelope {
        match id {
            Some(id) => Envelope::ReceiveRequest { id, inner },
            None => Envelope::ReceiveNotification { inner },
        }
    }

    /// Wrap a message a component wants to send to its successor.
    pub fn send(id: Option<Id>, inner: InnerMessage) -> Envelope {
        match id {
            Some(id) => Envelope::SendRequest { id, inner },
            None => Envelope::SendNotification { inner },
        }
    }

    pub fn inner(&self) -> &InnerMessage {
        match self {
            Envelope::SendRequest { inner, .. }
            | Envelope::SendNotification { inner }
            | Envelope::ReceiveRequest { inner, .. }
            | Envelope::ReceiveNotification { inner } => inner,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Envelope::SendRequest { id, inner } => {
                Message::request(id, SEND_REQUEST, Some(inner.to_params()))
            }
            Envelope::SendNotification { inner } => {
                Message::notification(SEND_NOTIFICATION, Some(inner.to_params()))
            }
            Envelope::ReceiveRequest { id, inner } => {
                Message::request(id, RECEIVE_REQUEST, Some(inner.to_params()))
            }
            Envelope::ReceiveNotification { inner } => {
                Message::notification(RECEIVE_NOTIFICATION, Some(inner.to_params()))
            }
        }
    }
}

/// Direction of a bridge operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeDirection {
    ClientToServer,
    ServerToClient,
}

impl BridgeDirection {
    pub fn method(self) -> &'static str {
        match self {
            BridgeDirection::ClientToServer => MCP_CLIENT_TO_SERVER,
            BridgeDirection::ServerToClient => MCP_SERVER_TO_CLIENT,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BridgeParams {
    token: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connection_id: Option<Uuid>,
    message: InnerMessage,
}

/// `{token, connectionId?, message}` for one of the two bridge operations.
///
/// The conductor names the bridge connection a client-to-server message
/// came from. A server answering or calling back may name the connection
/// it targets; without one, the token's only live connection is used.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEnvelope {
    pub direction: BridgeDirection,
    pub token: Uuid,
    pub connection_id: Option<Uuid>,
    pub message: InnerMessage,
}

impl BridgeEnvelope {
    /// Recognize a bridge operation in an (already unwrapped) inner message.
    pub fn parse(inner: &InnerMessage) -> Result<Option<BridgeEnvelope>, ConductorError> {
        let direction = match inner.method.as_str() {
            MCP_CLIENT_TO_SERVER => BridgeDirection::ClientToServer,
            MCP_SERVER_TO_CLIENT => BridgeDirection::ServerToClient,
            _ => return Ok(None),
        };
        let params = inner
            .params
            .clone()
            .ok_or_else(|| ConductorError::protocol(format!("`{}` without params", inner.method)))?;
        let BridgeParams {
            token,
            connection_id,
            message,
        } = serde_json::from_value(params).map_err(|e| {
            ConductorError::protocol(format!("malformed `{}` params: {e}", inner.method))
        })?;
        Ok(Some(BridgeEnvelope {
            direction,
            token,
            connection_id,
            message,
        }))
    }

    pub fn into_inner(self) -> InnerMessage {
        let params = BridgeParams {
            token: self.token,
            connection_id: self.connection_id,
            message: self.message,
        };
        InnerMessage::new(
            self.direction.method(),
            Some(serde_json::to_value(params).unwrap_or(Value::Null)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;
    use serde_json::json;

    #[test]
    fn test_parse_outbound_request() {
        let message = Message::request(
            Id::Number(1),
            SEND_REQUEST,
            Some(json!({"method": "ping"})),
        );
        let envelope = Envelope::parse(&message).unwrap().unwrap();
        assert_eq!(
            envelope,
            Envelope::SendRequest {
                id: Id::Number(1),
                inner: InnerMessage::new("ping", None),
            }
        );
    }

    #[test]
    fn test_ordinary_messages_are_not_envelopes() {
        let message = Message::request(Id::Number(1), "session/prompt", Some(json!({})));
        assert_eq!(Envelope::parse(&message).unwrap(), None);
        let response = Message::response(Id::Number(1), Ok(json!({})));
        assert_eq!(Envelope::parse(&response).unwrap(), None);
    }

    #[test]
    fn test_malformed_envelopes() {
        let no_payload = Message::request(Id::Number(1), SEND_REQUEST, None);
        assert!(Envelope::parse(&no_payload).is_err());

        let bad_payload = Message::request(Id::Number(1), SEND_REQUEST, Some(json!({"params": 1})));
        assert!(Envelope::parse(&bad_payload).is_err());

        let wrong_kind = Message::notification(SEND_REQUEST, Some(json!({"method": "x"})));
        assert!(Envelope::parse(&wrong_kind).is_err());

        let wrong_kind = Message::request(Id::Number(2), RECEIVE_NOTIFICATION, Some(json!({"method": "x"})));
        assert!(Envelope::parse(&wrong_kind).is_err());
    }

    #[test]
    fn test_receive_envelope_wire_format() {
        let message = Envelope::receive(
            Some(Id::Number(4)),
            InnerMessage::new("session/request_permission", Some(json!({"sessionId": "s"}))),
        )
        .into_message();
        expect![[r#"{"jsonrpc":"2.0","id":4,"method":"_proxy/successor/receive/request","params":{"method":"session/request_permission","params":{"sessionId":"s"}}}"#]]
            .assert_eq(&message.to_line());
    }

    #[test]
    fn test_bridge_envelope() {
        let token = Uuid::new_v4();
        let connection = Uuid::new_v4();
        let inner = BridgeEnvelope {
            direction: BridgeDirection::ClientToServer,
            token,
            connection_id: Some(connection),
            message: InnerMessage::new("tools/list", Some(json!({}))),
        }
        .into_inner();
        assert_eq!(inner.method, MCP_CLIENT_TO_SERVER);
        assert_eq!(
            inner.params.as_ref().unwrap()["connectionId"],
            json!(connection.to_string())
        );

        let parsed = BridgeEnvelope::parse(&inner).unwrap().unwrap();
        assert_eq!(parsed.token, token);
        assert_eq!(parsed.connection_id, Some(connection));
        assert_eq!(parsed.message.method, "tools/list");

        let reply = InnerMessage::new(
            MCP_SERVER_TO_CLIENT,
            Some(json!({"token": token, "message": {"method": "notifications/progress"}})),
        );
        let parsed = BridgeEnvelope::parse(&reply).unwrap().unwrap();
        assert_eq!(parsed.direction, BridgeDirection::ServerToClient);
        assert_eq!(parsed.connection_id, None);

        assert_eq!(
            BridgeEnvelope::parse(&InnerMessage::new("ping", None)).unwrap(),
            None
        );
        assert!(BridgeEnvelope::parse(&InnerMessage::new(MCP_SERVER_TO_CLIENT, None)).is_err());
    }
}
