//! Workspace client: an authenticated session bound to exactly one
//! credential source.
//!
//! A [`WorkspaceClient`] is built by a resolver for one outbound operation
//! and dropped afterwards. Only the REST endpoints the gateway needs are
//! covered.

use std::collections::BTreeMap;
use std::sync::Arc;

use dbx_protocol::{OperationError, OperationResult};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::oauth::ServicePrincipalSession;

/// Which identity a client acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// The end user, via the platform-forwarded token.
    ForwardedUser,
    /// A local CLI profile.
    CliProfile { profile: String },
    /// The app's service principal.
    ServicePrincipal,
}

/// How requests are authenticated.
#[derive(Clone)]
pub enum Credential {
    Bearer(SecretString),
    ServicePrincipal(Arc<ServicePrincipalSession>),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("Bearer([REDACTED])"),
            Self::ServicePrincipal(session) => write!(f, "ServicePrincipal({})", session.client_id()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CurrentUser {
    #[serde(rename = "userName", default)]
    pub user_name: String,
}

/// Named statement parameter. Values travel as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementParameter {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatementRequest {
    pub statement: String,
    pub warehouse_id: String,
    pub parameters: Vec<StatementParameter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatementResult {
    pub statement_id: String,
    pub state: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

/// Operations a resolved client can perform against the workspace.
pub trait WorkspaceApi: Send + Sync {
    fn current_user(&self) -> impl std::future::Future<Output = OperationResult<CurrentUser>> + Send;

    fn execute_sql(
        &self,
        request: &StatementRequest,
    ) -> impl std::future::Future<Output = OperationResult<StatementResult>> + Send;

    fn run_job(
        &self,
        job_id: u64,
        parameters: &BTreeMap<String, String>,
    ) -> impl std::future::Future<Output = OperationResult<u64>> + Send;

    fn query_endpoint(
        &self,
        name: &str,
        request: &ChatRequest,
    ) -> impl std::future::Future<Output = OperationResult<Value>> + Send;
}

/// REST client for one workspace and one identity.
#[derive(Debug)]
pub struct WorkspaceClient {
    host: String,
    credential: Credential,
    identity: IdentitySource,
    http: reqwest::Client,
}

impl WorkspaceClient {
    pub fn new(
        host: impl Into<String>,
        credential: Credential,
        identity: IdentitySource,
        http: reqwest::Client,
    ) -> Self {
        Self {
            host: host.into(),
            credential,
            identity,
            http,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn identity(&self) -> &IdentitySource {
        &self.identity
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    async fn bearer(&self) -> OperationResult<String> {
        match &self.credential {
            Credential::Bearer(token) => Ok(format!("Bearer {}", token.expose_secret())),
            Credential::ServicePrincipal(session) => {
                let token = session.access_token().await.map_err(|e| {
                    OperationError::authorization(format!("Service principal authentication failed: {e}"))
                })?;
                Ok(format!("Bearer {}", token.expose_secret()))
            }
        }
    }

    /// Workspace URL from path segments. Each segment is percent-encoded, so
    /// caller-supplied names cannot change the path.
    fn url(&self, segments: &[&str]) -> OperationResult<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.host)
            .map_err(|e| OperationError::configuration(format!("Invalid workspace host {}: {e}", self.host)))?;
        url.path_segments_mut()
            .map_err(|_| OperationError::configuration(format!("Invalid workspace host {}", self.host)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, method: reqwest::Method, segments: &[&str], body: Option<&Value>) -> OperationResult<Value> {
        let url = self.url(segments)?;
        let path = url.path().to_string();
        debug!("{method} {url} as {:?}", self.identity);

        let mut request = self
            .http
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, self.bearer().await?);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OperationError::upstream(format!("Request to {path} failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OperationError::upstream(format!("Failed to read response from {path}: {e}")))?;

        if !status.is_success() {
            return Err(OperationError::upstream(format!("{status}: {}", upstream_message(&text))));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| OperationError::upstream(format!("Invalid JSON from {path}: {e}")))
    }
}

/// Databricks error bodies look like `{"error_code": "...", "message": "..."}`.
fn upstream_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatementResponse {
    statement_id: String,
    #[serde(default)]
    status: Option<StatementStatus>,
    #[serde(default)]
    manifest: Option<StatementManifest>,
    #[serde(default)]
    result: Option<StatementData>,
}

#[derive(Deserialize)]
struct StatementStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Deserialize)]
struct StatementError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct StatementManifest {
    #[serde(default)]
    schema: Option<StatementSchema>,
}

#[derive(Deserialize)]
struct StatementSchema {
    #[serde(default)]
    columns: Vec<StatementColumn>,
}

#[derive(Deserialize)]
struct StatementColumn {
    name: String,
}

#[derive(Deserialize)]
struct StatementData {
    #[serde(default)]
    data_array: Option<Vec<Vec<Value>>>,
}

#[derive(Deserialize)]
struct RunNowResponse {
    run_id: u64,
}

impl WorkspaceApi for WorkspaceClient {
    async fn current_user(&self) -> OperationResult<CurrentUser> {
        let value = self
            .send(reqwest::Method::GET, &["api", "2.0", "preview", "scim", "v2", "Me"], None)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| OperationError::upstream(format!("Unexpected current user response: {e}")))
    }

    async fn execute_sql(&self, request: &StatementRequest) -> OperationResult<StatementResult> {
        let body = json!({
            "warehouse_id": request.warehouse_id,
            "statement": request.statement,
            "parameters": request.parameters,
            "wait_timeout": "30s",
        });
        let value = self
            .send(reqwest::Method::POST, &["api", "2.0", "sql", "statements"], Some(&body))
            .await?;
        let response: StatementResponse = serde_json::from_value(value)
            .map_err(|e| OperationError::upstream(format!("Unexpected statement response: {e}")))?;

        let (state, error) = response
            .status
            .map(|s| (s.state, s.error))
            .unwrap_or_default();
        if matches!(state.as_str(), "FAILED" | "CANCELED" | "CLOSED") {
            let message = error
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("Statement {} ended in state {state}", response.statement_id));
            return Err(OperationError::upstream(message));
        }

        let columns = response
            .manifest
            .and_then(|m| m.schema)
            .map(|s| s.columns.into_iter().map(|c| c.name).collect())
            .unwrap_or_default();
        let rows = response
            .result
            .and_then(|r| r.data_array)
            .unwrap_or_default();

        Ok(StatementResult {
            statement_id: response.statement_id,
            state,
            columns,
            rows,
        })
    }

    async fn run_job(&self, job_id: u64, parameters: &BTreeMap<String, String>) -> OperationResult<u64> {
        let body = json!({
            "job_id": job_id,
            "job_parameters": parameters,
        });
        let value = self
            .send(reqwest::Method::POST, &["api", "2.1", "jobs", "run-now"], Some(&body))
            .await?;
        let response: RunNowResponse = serde_json::from_value(value)
            .map_err(|e| OperationError::upstream(format!("Unexpected run-now response: {e}")))?;
        Ok(response.run_id)
    }

    async fn query_endpoint(&self, name: &str, request: &ChatRequest) -> OperationResult<Value> {
        if matches!(name, "." | "..") {
            return Err(OperationError::invalid_input(format!("Invalid endpoint name: {name}")));
        }
        let body = serde_json::to_value(request)
            .map_err(|e| OperationError::invalid_input(format!("Cannot encode chat request: {e}")))?;
        self.send(
            reqwest::Method::POST,
            &["serving-endpoints", name, "invocations"],
            Some(&body),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbx_protocol::ErrorKind;
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> WorkspaceClient {
        WorkspaceClient::new(
            server.base_url(),
            Credential::Bearer(SecretString::from("user-tok")),
            IdentitySource::ForwardedUser,
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn current_user_sends_bearer_token() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/2.0/preview/scim/v2/Me")
                .header("authorization", "Bearer user-tok");
            then.status(200).json_body(json!({"userName": "ada@example.com"}));
        });

        let user = client(&server).current_user().await.unwrap();
        assert_eq!(user.user_name, "ada@example.com");
        mock.assert();
    }

    #[tokio::test]
    async fn execute_sql_reads_columns_and_rows() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/2.0/sql/statements")
                .body_includes(r#""warehouse_id":"wh-1""#)
                .body_includes(r#"{"name":"cluster_id","value":"1"}"#);
            then.status(200).json_body(json!({
                "statement_id": "st-1",
                "status": {"state": "SUCCEEDED"},
                "manifest": {"schema": {"columns": [{"name": "id"}, {"name": "name"}]}},
                "result": {"data_array": [["1", "a"], ["2", null]]}
            }));
        });

        let result = client(&server)
            .execute_sql(&StatementRequest {
                statement: "SELECT * FROM t WHERE cluster_id = :cluster_id".into(),
                warehouse_id: "wh-1".into(),
                parameters: vec![StatementParameter {
                    name: "cluster_id".into(),
                    value: Some("1".into()),
                }],
            })
            .await
            .unwrap();

        assert_eq!(result.statement_id, "st-1");
        assert_eq!(result.columns, vec!["id", "name"]);
        assert_eq!(result.rows.len(), 2);
        assert!(result.rows[1][1].is_null());
        mock.assert();
    }

    #[tokio::test]
    async fn failed_statement_is_upstream_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/2.0/sql/statements");
            then.status(200).json_body(json!({
                "statement_id": "st-2",
                "status": {"state": "FAILED", "error": {"message": "TABLE_OR_VIEW_NOT_FOUND"}}
            }));
        });

        let err = client(&server)
            .execute_sql(&StatementRequest {
                statement: "SELECT 1".into(),
                warehouse_id: "wh".into(),
                parameters: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert_eq!(err.message, "TABLE_OR_VIEW_NOT_FOUND");
    }

    #[tokio::test]
    async fn error_body_message_is_surfaced() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/2.1/jobs/run-now");
            then.status(403).json_body(json!({
                "error_code": "PERMISSION_DENIED",
                "message": "User does not have Manage Run permission"
            }));
        });

        let err = client(&server).run_job(42, &BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert!(err.message.starts_with("403"));
        assert!(err.message.contains("Manage Run permission"));
    }

    #[tokio::test]
    async fn run_job_returns_run_id() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/2.1/jobs/run-now")
                .json_body(json!({"job_id": 42, "job_parameters": {"env": "dev"}}));
            then.status(200).json_body(json!({"run_id": 777, "number_in_job": 777}));
        });

        let params = BTreeMap::from([("env".to_string(), "dev".to_string())]);
        assert_eq!(client(&server).run_job(42, &params).await.unwrap(), 777);
        mock.assert();
    }

    #[tokio::test]
    async fn query_endpoint_posts_chat_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/serving-endpoints/gemma/invocations")
                .json_body(json!({
                    "messages": [{"role": "user", "content": "hi"}],
                    "max_tokens": 10
                }));
            then.status(200).json_body(json!({"choices": [{"message": {"content": "hello"}}]}));
        });

        let result = client(&server)
            .query_endpoint(
                "gemma",
                &ChatRequest {
                    messages: vec![ChatMessage {
                        role: ChatRole::User,
                        content: "hi".into(),
                    }],
                    max_tokens: Some(10),
                    temperature: None,
                    top_p: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(result["choices"][0]["message"]["content"], "hello");
        mock.assert();
    }

    #[test]
    fn endpoint_name_is_a_single_encoded_segment() {
        let client = WorkspaceClient::new(
            "https://adb-1.example.com/",
            Credential::Bearer(SecretString::from("user-tok")),
            IdentitySource::ForwardedUser,
            reqwest::Client::new(),
        );
        let url = client
            .url(&["serving-endpoints", "../jobs/run-now?x#y", "invocations"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://adb-1.example.com/serving-endpoints/..%2Fjobs%2Frun-now%3Fx%23y/invocations"
        );
    }

    #[tokio::test]
    async fn dot_segment_endpoint_names_are_rejected() {
        let server = MockServer::start();
        let mock = server.mock(|_when, then| {
            then.status(200);
        });

        let request = ChatRequest {
            messages: vec![],
            max_tokens: None,
            temperature: None,
            top_p: None,
        };
        for name in [".", ".."] {
            let err = client(&server).query_endpoint(name, &request).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidInput);
        }
        mock.assert_calls(0);
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential::Bearer(SecretString::from("user-tok"));
        assert_eq!(format!("{cred:?}"), "Bearer([REDACTED])");
    }
}
