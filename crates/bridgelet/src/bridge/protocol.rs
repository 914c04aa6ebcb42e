//! Wire message types for bridge-worker communication.
//!
//! One request line, one response line, per process lifetime. The response
//! carries exactly one of `result` / `error`.

use serde::{Deserialize, Serialize};

/// Correlation id tying a response line to the request that produced it.
///
/// UUID v4 so a confused or malicious worker cannot guess a colliding id
/// from a previous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request line sent to the worker on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: CallId,
    pub method: String,
    pub params: Vec<serde_json::Value>,
}

/// Error object reported by the worker inside a response line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

/// Response line read from the worker's stdout.
///
/// Deserialized permissively; [`WireResponse::into_outcome`] enforces the
/// exactly-one-of-result-or-error rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl WireResponse {
    /// Split into the worker's verdict, rejecting malformed combinations.
    pub fn into_outcome(self) -> Result<Result<serde_json::Value, WireError>, String> {
        match (self.result, self.error) {
            (Some(_), Some(_)) => Err("response carries both result and error".to_string()),
            (Some(result), None) => Ok(Ok(result)),
            (None, Some(error)) => Ok(Err(error)),
            (None, None) => Err("response carries neither result nor error".to_string()),
        }
    }
}
