//! Request context: per-request state threaded through request handling.
//!
//! The transport builds one [`RequestContext`] for every inbound HTTP request
//! from its headers. The forwarded access token lives only as long as the
//! context does; it is never stored anywhere else.

use secrecy::{ExposeSecret, SecretString};

/// Header the hosting platform uses to forward the end user's token.
pub const FORWARDED_ACCESS_TOKEN_HEADER: &str = "x-forwarded-access-token";

/// Header carrying an upstream request id, if any.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Context for a single request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Correlation id for logs.
    pub request_id: String,
    /// Bearer token forwarded by the platform on behalf of the end user.
    pub forwarded_token: Option<SecretString>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            forwarded_token: None,
        }
    }

    /// Attach a forwarded token. Blank values are treated as absent.
    pub fn with_forwarded_token(mut self, token: Option<String>) -> Self {
        self.forwarded_token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(SecretString::from);
        self
    }

    pub fn has_forwarded_token(&self) -> bool {
        self.forwarded_token
            .as_ref()
            .is_some_and(|t| !t.expose_secret().is_empty())
    }
}
