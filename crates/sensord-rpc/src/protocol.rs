//! JSON-RPC 2.0 protocol types.
//!
//! This module provides the request/response envelopes exchanged with the
//! sensord API socket and the fixed error-code table.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const SENSOR_NOT_FOUND: i32 = -32001;
pub const NO_SENSORS: i32 = -32002;
pub const UNKNOWN_COMMAND: i32 = -32003;
pub const NOT_CONFIG_COMMAND: i32 = -32004;

pub const METHOD_COMMAND: &str = "sen0395.command";
pub const METHOD_CONFIGURE: &str = "sen0395.configure";
pub const METHOD_STATUS: &str = "sen0395.status";
pub const METHOD_READING: &str = "sen0395.reading";

/// Request parameters: always a JSON object
pub type Params = Map<String, Value>;

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub id: Value,
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Params, id: impl Into<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: id.into(),
        }
    }

    /// Parse a raw payload as a request envelope.
    ///
    /// The envelope is checked by hand rather than through `Deserialize` so
    /// that a structurally invalid request still yields its id.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Parse`] when the payload is not JSON and
    /// [`EnvelopeError::Invalid`] when it is JSON but not a valid request.
    pub fn parse(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(payload).map_err(EnvelopeError::Parse)?;

        let Value::Object(mut body) = value else {
            return Err(EnvelopeError::Invalid { id: Value::Null });
        };

        let id = body.remove("id").unwrap_or(Value::Null);
        let invalid = |id: Value| EnvelopeError::Invalid { id };

        if body.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(invalid(id));
        }

        let Some(Value::String(method)) = body.remove("method") else {
            return Err(invalid(id));
        };

        let params = match body.remove("params") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(params)) => params,
            Some(_) => return Err(invalid(id)),
        };

        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method,
            params,
            id,
        })
    }
}

/// Why a payload could not be turned into a [`Request`]
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Payload is not valid JSON: {0}")]
    Parse(serde_json::Error),

    #[error("Payload is not a valid request envelope")]
    Invalid { id: Value },
}

impl EnvelopeError {
    #[must_use]
    pub fn into_response(self) -> Response {
        match self {
            EnvelopeError::Parse(_) => Response::error(Value::Null, RpcError::parse_error()),
            EnvelopeError::Invalid { id } => Response::error(id, RpcError::invalid_request()),
        }
    }
}

/// JSON-RPC 2.0 Response.
///
/// `id` is always serialized, `null` when the request id is unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Value,
}

impl Response {
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Split into the result payload or the structured error.
    ///
    /// # Errors
    ///
    /// Returns the carried [`RpcError`], or an internal error when the
    /// response has neither a result nor an error.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Err(RpcError::internal_error()),
        }
    }
}

/// JSON-RPC 2.0 Error object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    #[must_use]
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    #[must_use]
    pub fn missing_field(field: &str) -> Self {
        Self::new(INVALID_PARAMS, format!("Missing field: {field}"))
    }

    #[must_use]
    pub fn invalid_field(field: &str) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid field: {field}"))
    }

    /// Internal failures never carry detail to the caller
    #[must_use]
    pub fn internal_error() -> Self {
        Self::new(INTERNAL_ERROR, "Internal error")
    }

    #[must_use]
    pub fn sensor_not_found(name: &str) -> Self {
        Self::new(SENSOR_NOT_FOUND, format!("Sensor {name} not found"))
    }

    #[must_use]
    pub fn no_sensors() -> Self {
        Self::new(NO_SENSORS, "No sensors found")
    }

    #[must_use]
    pub fn unknown_command(command: &Value) -> Self {
        let command = match command {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self::new(
            UNKNOWN_COMMAND,
            format!("Command {command} is not recognized"),
        )
    }

    #[must_use]
    pub fn not_config_command(command: impl std::fmt::Display) -> Self {
        Self::new(
            NOT_CONFIG_COMMAND,
            format!("Command {command} is not a configuration command"),
        )
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}
