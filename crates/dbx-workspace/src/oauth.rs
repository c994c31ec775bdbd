//! Service principal session: OAuth client-credentials tokens for the app's
//! own identity.
//!
//! The token is cached with its lifetime and refreshed shortly before it
//! expires. The cache lock is never held across an `.await`; two requests
//! racing on an expired token may both fetch one, and the later write wins.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::CredentialError;
use crate::settings::ServicePrincipalCredentials;

/// Token lifetime assumed when the endpoint omits `expires_in`.
const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Refresh this long before the token expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    token: SecretString,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct ServicePrincipalSession {
    host: String,
    credentials: ServicePrincipalCredentials,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for ServicePrincipalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePrincipalSession")
            .field("host", &self.host)
            .field("client_id", &self.credentials.client_id)
            .finish_non_exhaustive()
    }
}

impl ServicePrincipalSession {
    pub fn new(host: impl Into<String>, credentials: ServicePrincipalCredentials, http: reqwest::Client) -> Self {
        Self {
            host: host.into(),
            credentials,
            http,
            cached: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    /// Current access token, fetching a new one when the cached token is
    /// missing or about to expire.
    pub async fn access_token(&self) -> Result<SecretString, CredentialError> {
        {
            let cached = self.cached.lock();
            if let Some(entry) = cached.as_ref()
                && Instant::now() < entry.refresh_at
            {
                return Ok(entry.token.clone());
            }
        }

        let (token, lifetime) = self.request_token().await?;
        let refresh_at = Instant::now() + lifetime.saturating_sub(REFRESH_MARGIN.min(lifetime / 2));
        *self.cached.lock() = Some(CachedToken {
            token: token.clone(),
            refresh_at,
        });
        Ok(token)
    }

    async fn request_token(&self) -> Result<(SecretString, Duration), CredentialError> {
        let endpoint = format!("{}/oidc/v1/token", self.host);
        debug!("Requesting service principal token from {endpoint}");

        let response = self
            .http
            .post(&endpoint)
            .basic_auth(
                &self.credentials.client_id,
                Some(self.credentials.client_secret.expose_secret()),
            )
            .form(&[("grant_type", "client_credentials"), ("scope", "all-apis")])
            .send()
            .await
            .map_err(|e| CredentialError::TokenEndpoint(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::TokenEndpoint(format!("{status}: {}", body.trim())));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::TokenEndpoint(e.to_string()))?;

        if let Some(ref tt) = parsed.token_type
            && !tt.eq_ignore_ascii_case("bearer")
        {
            return Err(CredentialError::UnsupportedTokenType(tt.clone()));
        }

        let lifetime = parsed.expires_in.map(Duration::from_secs).unwrap_or(DEFAULT_TTL);
        info!(
            "Obtained service principal token for {} (expires in {}s)",
            self.credentials.client_id,
            lifetime.as_secs()
        );
        Ok((SecretString::from(parsed.access_token), lifetime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn session(server: &MockServer) -> ServicePrincipalSession {
        ServicePrincipalSession::new(
            server.base_url(),
            ServicePrincipalCredentials {
                client_id: "sp-id".into(),
                client_secret: SecretString::from("sp-secret"),
            },
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn fetches_token_with_basic_auth() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oidc/v1/token")
                .header_exists("authorization")
                .body_includes("grant_type=client_credentials")
                .body_includes("scope=all-apis");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"sp-tok","token_type":"Bearer","expires_in":3600}"#);
        });

        let token = session(&server).access_token().await.unwrap();
        assert_eq!(token.expose_secret(), "sp-tok");
        mock.assert();
    }

    #[tokio::test]
    async fn caches_token_until_refresh() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oidc/v1/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"sp-tok","expires_in":3600}"#);
        });

        let session = session(&server);
        session.access_token().await.unwrap();
        session.access_token().await.unwrap();
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn expired_token_is_refetched() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oidc/v1/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"short","expires_in":0}"#);
        });

        let session = session(&server);
        session.access_token().await.unwrap();
        session.access_token().await.unwrap();
        mock.assert_calls(2);
    }

    #[tokio::test]
    async fn rejected_credentials_surface_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oidc/v1/token");
            then.status(401).body("invalid_client");
        });

        match session(&server).access_token().await {
            Err(CredentialError::TokenEndpoint(msg)) => {
                assert!(msg.contains("401"));
                assert!(msg.contains("invalid_client"));
            }
            other => panic!("expected token endpoint error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_bearer_token_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oidc/v1/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"x","token_type":"mac"}"#);
        });

        assert!(matches!(
            session(&server).access_token().await,
            Err(CredentialError::UnsupportedTokenType(t)) if t == "mac"
        ));
    }

    #[test]
    fn debug_hides_secret() {
        let server = MockServer::start();
        let rendered = format!("{:?}", session(&server));
        assert!(rendered.contains("sp-id"));
        assert!(!rendered.contains("sp-secret"));
    }
}
