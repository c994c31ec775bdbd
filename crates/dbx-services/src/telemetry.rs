//! Structured event forwarding to Azure Log Analytics.
//!
//! Events go to the HTTP Data Collector API, signed with the workspace
//! shared key. Forwarding is best effort: a failed send is logged locally
//! and never fails the operation that produced the event.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use dbx_protocol::outcome::new_error_id;
use dbx_protocol::{OperationError, OperationResult};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{debug, error, info, warn};

const API_VERSION: &str = "2016-04-01";
const RESOURCE: &str = "/api/logs";
const CONTENT_TYPE: &str = "application/json";

/// Log types recorded by the gateway.
pub mod log_types {
    pub const CONNECTION: &str = "DatabricksApp_Connection";
    pub const WARNING: &str = "DatabricksApp_Warning";
    pub const ERROR: &str = "DatabricksApp_Error";
    pub const SQL_QUERY: &str = "DatabricksApp_SQLQuery";
    pub const JOB_SUBMISSION: &str = "DatabricksApp_JobSubmission";
    pub const MODEL_SERVING: &str = "DatabricksApp_ModelServing";
    pub const HEALTH: &str = "DatabricksApp_Health";
    pub const TEST_LOG: &str = "DatabricksApp_TestLog";
    pub const SHUTDOWN: &str = "DatabricksApp_Shutdown";
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("shared key is not valid base64: {0}")]
    InvalidKey(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("collector rejected the batch: {0}")]
    Rejected(String),
}

/// `base64(HMAC-SHA256(base64decode(key), string-to-sign))` for the collector API.
pub fn build_signature(shared_key: &str, date: &str, content_length: usize) -> Result<String, TelemetryError> {
    let key = STANDARD
        .decode(shared_key.trim())
        .map_err(|e| TelemetryError::InvalidKey(e.to_string()))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key).map_err(|e| TelemetryError::InvalidKey(e.to_string()))?;
    let payload = format!("POST\n{content_length}\n{CONTENT_TYPE}\nx-ms-date:{date}\n{RESOURCE}");
    mac.update(payload.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// RFC 1123 date as the collector expects it in `x-ms-date`.
pub fn rfc1123_now() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub struct LogAnalyticsSink {
    workspace_id: String,
    shared_key: SecretString,
    endpoint: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for LogAnalyticsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogAnalyticsSink")
            .field("workspace_id", &self.workspace_id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl LogAnalyticsSink {
    pub fn new(workspace_id: impl Into<String>, shared_key: SecretString, http: reqwest::Client) -> Self {
        let workspace_id = workspace_id.into();
        let endpoint = format!("https://{workspace_id}.ods.opinsights.azure.com");
        Self {
            workspace_id,
            shared_key,
            endpoint,
            http,
        }
    }

    /// Both halves must be present and non-blank.
    pub fn from_parts(
        workspace_id: Option<String>,
        shared_key: Option<SecretString>,
        http: reqwest::Client,
    ) -> Option<Self> {
        let workspace_id = workspace_id.map(|w| w.trim().to_string()).filter(|w| !w.is_empty())?;
        let shared_key = shared_key.filter(|k| !k.expose_secret().trim().is_empty())?;
        Some(Self::new(workspace_id, shared_key, http))
    }

    /// Send to a different base URL (tests, sovereign clouds).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub async fn send(&self, log_type: &str, data: &Value) -> Result<(), TelemetryError> {
        let body = serde_json::to_vec(data).map_err(|e| TelemetryError::Request(e.to_string()))?;
        let date = rfc1123_now();
        let signature = build_signature(self.shared_key.expose_secret(), &date, body.len())?;

        let response = self
            .http
            .post(format!("{}{RESOURCE}?api-version={API_VERSION}", self.endpoint))
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("SharedKey {}:{signature}", self.workspace_id),
            )
            .header("Log-Type", log_type)
            .header("x-ms-date", date)
            .body(body)
            .send()
            .await
            .map_err(|e| TelemetryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Rejected(format!("{status}: {}", text.trim())));
        }
        Ok(())
    }
}

/// Handle the services use to record events and failures.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    sink: Option<Arc<LogAnalyticsSink>>,
}

impl Telemetry {
    pub fn new(sink: Option<LogAnalyticsSink>) -> Self {
        match &sink {
            Some(s) => info!("Azure Log Analytics configured for workspace {}", s.workspace_id),
            None => warn!("Azure Log Analytics not configured - missing credentials"),
        }
        Self {
            sink: sink.map(Arc::new),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.sink.is_some()
    }

    /// Forward one event. No-op when no sink is configured.
    pub async fn record(&self, log_type: &str, data: Value) {
        let Some(sink) = &self.sink else {
            return;
        };
        match sink.send(log_type, &data).await {
            Ok(()) => debug!("Sent {log_type} to Azure Log Analytics"),
            Err(e) => warn!("Failed to send logs to Azure Log Analytics: {e}"),
        }
    }

    /// Log a failed operation, forward it as an error event and build the
    /// caller-facing failure payload.
    pub async fn report_failure(&self, context: &str, err: &OperationError) -> Value {
        let error_id = new_error_id();
        error!(kind = %err.kind, "Error in {context}: {}", err.message);

        self.record(
            log_types::ERROR,
            json!({
                "error_id": error_id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "context": context,
                "error_type": err.kind.type_name(),
                "error_message": err.message,
            }),
        )
        .await;

        err.to_failure_payload(&error_id)
    }

    /// Collapse an operation result into the value returned to the caller.
    pub async fn settle(&self, context: &str, result: OperationResult<Value>) -> Value {
        match result {
            Ok(value) => value,
            Err(e) => self.report_failure(context, &e).await,
        }
    }
}
