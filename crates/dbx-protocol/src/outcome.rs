//! Operation error taxonomy and the structured failure payload.
//!
//! Every operation returns `OperationResult<T>`. At the service boundary a
//! failure is turned into `{ success: false, error, errorKind, errorId }`
//! and returned as a normal JSON-RPC result, so a failing Databricks call
//! never reaches the caller as a protocol fault.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Which part of the request path failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Required configuration (host, warehouse) is missing.
    Configuration,
    /// No valid credential path for this request.
    Authorization,
    /// The outbound API call itself failed.
    Upstream,
    /// The request was rejected before any outbound call.
    InvalidInput,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Authorization => "authorization",
            Self::Upstream => "upstream",
            Self::InvalidInput => "invalid_input",
        }
    }

    /// Type name recorded in forwarded error events.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Configuration => "ConfigurationError",
            Self::Authorization => "AuthorizationError",
            Self::Upstream => "UpstreamError",
            Self::InvalidInput => "ValidationError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed operation: a kind tag plus a human-readable cause that callers
/// show verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type OperationResult<T> = Result<T, OperationError>;

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Caller-facing message, prefixed with the error id.
    pub fn display_message(&self, error_id: &str) -> String {
        format!("Error ({error_id}): {}", self.message)
    }

    /// The `{ success: false, ... }` payload returned to the caller.
    pub fn to_failure_payload(&self, error_id: &str) -> Value {
        json!({
            "success": false,
            "error": self.display_message(error_id),
            "errorKind": self.kind,
            "errorId": error_id,
        })
    }
}

/// A fresh error id: the UTC time the failure was recorded.
pub fn new_error_id() -> String {
    chrono::Utc::now().to_rfc3339()
}
