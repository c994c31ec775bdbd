//! App service: health and identity report.

use std::sync::Arc;

use dbx_protocol::{HandlerResult, Methods, RequestContext, RpcError};
use dbx_workspace::{CredentialResolver, IdentitySource, PrivilegedResolver, WorkspaceApi};
use serde_json::{Value, json};
use tracing::warn;

use crate::telemetry::{Telemetry, log_types};
use crate::{Service, timestamp};

pub struct StatusService {
    resolver: Arc<CredentialResolver>,
    privileged: Arc<PrivilegedResolver>,
    telemetry: Telemetry,
    default_job_id: Option<String>,
}

impl StatusService {
    pub fn new(resolver: Arc<CredentialResolver>, privileged: Arc<PrivilegedResolver>, telemetry: Telemetry) -> Self {
        Self {
            resolver,
            privileged,
            telemetry,
            default_job_id: None,
        }
    }

    /// Job id front ends pre-fill in their submission form.
    pub fn with_default_job_id(mut self, job_id: Option<String>) -> Self {
        self.default_job_id = job_id.map(|j| j.trim().to_string()).filter(|j| !j.is_empty());
        self
    }

    async fn status(&self, ctx: &RequestContext) -> Value {
        let settings = self.resolver.settings();
        let mut report = json!({
            "status": "healthy",
            "timestamp": timestamp(),
            "appServicePrincipal": if self.privileged.service_principal_available() { "available" } else { "not available" },
            "azureLoggingConfigured": self.telemetry.is_configured(),
            "appName": settings.app_name_or_default(),
            "workspaceId": settings.workspace_id_or_default(),
            "userAuthorization": "enabled",
        });
        if let Some(job_id) = &self.default_job_id {
            report["defaultJobId"] = json!(job_id);
        }

        match self.resolver.resolve_client(ctx).await {
            Ok(client) => match client.current_user().await {
                Ok(user) => {
                    report["currentUser"] = json!(user.user_name);
                    report["userAuthorized"] = json!(true);
                    if matches!(client.identity(), IdentitySource::CliProfile { .. }) {
                        report["authMode"] = json!("cli_fallback");
                        report["note"] = json!("Using CLI authentication for local development");
                    } else {
                        report["authMode"] = json!("user_authorization");
                    }
                }
                Err(e) => {
                    warn!("Identity lookup failed during status check: {e}");
                    report["authMode"] = json!("error");
                    report["currentUser"] = json!(format!("error: {e}"));
                    report["userAuthorized"] = json!(false);
                }
            },
            Err(e) => {
                warn!("No credential available during status check: {e}");
                report["authMode"] = json!("none");
                report["currentUser"] = json!("authentication failed");
                report["userAuthorized"] = json!(false);
            }
        }

        self.telemetry.record(log_types::HEALTH, report.clone()).await;
        report
    }
}

impl Service for StatusService {
    fn namespace(&self) -> &str {
        "app"
    }

    async fn handle(&self, method: &str, _params: Option<Value>, ctx: &RequestContext) -> HandlerResult {
        match method {
            Methods::APP_STATUS => Ok(self.status(ctx).await),
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}
