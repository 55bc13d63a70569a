//! Request and Response message types.
//!
//! Defines the message format for command requests and responses
//! between the local end and the remote debug server.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::{ClientId, RequestId, RouteKey, SessionId};

use super::Command;

// ============================================================================
// Request
// ============================================================================

/// A command request from local end to remote end.
///
/// # Format
///
/// ```json
/// {
///   "id": "uuid",
///   "clientId": 1,
///   "sessionId": 3,
///   "method": "Domain.method",
///   "params": { ... }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Unique identifier for request/response correlation.
    pub id: RequestId,

    /// Target client.
    #[serde(rename = "clientId")]
    pub client_id: ClientId,

    /// Target session.
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,

    /// Command with method and params.
    #[serde(flatten)]
    pub command: Command,
}

impl Request {
    /// Creates a new request with auto-generated ID.
    #[inline]
    #[must_use]
    pub fn new(route: RouteKey, command: impl Into<Command>) -> Self {
        Self {
            id: RequestId::generate(),
            client_id: route.client_id,
            session_id: route.session_id,
            command: command.into(),
        }
    }

    /// Returns the route this request targets.
    #[inline]
    #[must_use]
    pub fn route(&self) -> RouteKey {
        RouteKey::new(self.client_id, self.session_id)
    }
}

// ============================================================================
// ProtocolError
// ============================================================================

/// Error payload reported by the remote end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    /// Error code.
    #[serde(default)]
    pub code: i64,

    /// Error message.
    #[serde(default)]
    pub message: String,

    /// Additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::transport(err.code, err.message)
    }
}

// ============================================================================
// Response
// ============================================================================

/// A response from remote end to local end.
///
/// # Format
///
/// Success:
/// ```json
/// { "id": "uuid", "result": { ... } }
/// ```
///
/// Error:
/// ```json
/// { "id": "uuid", "error": { "code": -32000, "message": "..." } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Matches the request `id`.
    pub id: RequestId,

    /// Result data (if success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error payload (if error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
}

impl Response {
    /// Creates a success response.
    #[inline]
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    #[inline]
    #[must_use]
    pub fn failure(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ProtocolError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Returns `true` if the remote end reported an error.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Extracts the result value, returning error if response was error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the response carries an error.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    /// Gets a string value from the result.
    ///
    /// Returns empty string if key not found or not a string.
    #[inline]
    #[must_use]
    pub fn get_string(&self, key: &str) -> String {
        self.result
            .as_ref()
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Gets a boolean value from the result.
    ///
    /// Returns false if key not found or not a boolean.
    #[inline]
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        self.result
            .as_ref()
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_bool())
            .unwrap_or_default()
    }
}

// ============================================================================
// Tests
// ============================================================================
