//! Error taxonomy for the conductor.

use crate::jsonrpc::{ErrorObject, Id};

/// JSON-RPC error codes used by the conductor when it has to answer a request itself.
pub mod codes {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The chain terminated (spawn failure or a component exited).
    pub const CHAIN_TERMINATED: i64 = -32000;
    pub const BRIDGE_ERROR: i64 = -32001;
    pub const TIMEOUT: i64 = -32002;
    pub const CONFIGURATION_ERROR: i64 = -32003;
}

#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// Malformed or unexpected message shape on some link.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A request whose id cannot be represented; answered with a null id.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A response referenced an unknown or expired local id.
    #[error("no pending request with id {id} on {peer}")]
    Routing { peer: String, id: Id },

    /// Spawn failure or unexpected process exit.
    #[error("process error: {0}")]
    Process(String),

    /// Port allocation, bridge spawn or bridge connection failure.
    #[error("MCP bridge error: {0}")]
    Bridge(String),

    /// Initialization did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The chain descriptor or a component's declarations are inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to resolve component `{id}`: {message}")]
    Resolution { id: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    pub fn protocol(message: impl ToString) -> Self {
        ConductorError::Protocol(message.to_string())
    }

    pub fn process(message: impl ToString) -> Self {
        ConductorError::Process(message.to_string())
    }

    pub fn bridge(message: impl ToString) -> Self {
        ConductorError::Bridge(message.to_string())
    }

    pub fn config(message: impl ToString) -> Self {
        ConductorError::Config(message.to_string())
    }

    /// True for errors that make the whole chain unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConductorError::Process(_)
                | ConductorError::Timeout(_)
                | ConductorError::Config(_)
                | ConductorError::Io(_)
        )
    }

    /// The error as it is reported inside a JSON-RPC error response.
    pub fn to_error_object(&self) -> ErrorObject {
        let code = match self {
            ConductorError::Protocol(_) | ConductorError::InvalidRequest(_) => {
                codes::INVALID_REQUEST
            }
            ConductorError::Routing { .. } => codes::INTERNAL_ERROR,
            ConductorError::Process(_) => codes::CHAIN_TERMINATED,
            ConductorError::Bridge(_) => codes::BRIDGE_ERROR,
            ConductorError::Timeout(_) => codes::TIMEOUT,
            ConductorError::Config(_) => codes::CONFIGURATION_ERROR,
            ConductorError::Resolution { .. } => codes::CONFIGURATION_ERROR,
            ConductorError::Io(_) => codes::INTERNAL_ERROR,
        };
        ErrorObject::new(code, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ConductorError::process("agent exited").to_error_object().code,
            codes::CHAIN_TERMINATED
        );
        assert_eq!(
            ConductorError::bridge("no port").to_error_object().code,
            codes::BRIDGE_ERROR
        );
        assert_eq!(
            ConductorError::InvalidRequest("id".into()).to_error_object().code,
            codes::INVALID_REQUEST
        );
        assert_eq!(
            ConductorError::protocol("bad").to_error_object().message,
            "protocol error: bad"
        );
    }

    #[test]
    fn test_fatality() {
        assert!(ConductorError::process("x").is_fatal());
        assert!(ConductorError::Timeout("init".into()).is_fatal());
        assert!(!ConductorError::bridge("x").is_fatal());
        assert!(!ConductorError::protocol("x").is_fatal());
    }
}
