//! Credential resolution.
//!
//! [`CredentialResolver`] picks the identity for per-user operations:
//!
//! | forwarded token | deployment        | result                          |
//! |-----------------|-------------------|---------------------------------|
//! | present         | hosted app        | client bound to the user token  |
//! | any             | local development | client from the CLI profile     |
//! | absent          | hosted app        | authorization error, no fallback|
//!
//! [`PrivilegedResolver`] picks the identity for operations that need the
//! app's own scope: the pre-initialised service principal first, the CLI
//! profile outside the platform, an error otherwise.
//!
//! Both take everything they need from [`WorkspaceSettings`]. Neither touches
//! the process environment, so concurrent resolutions cannot interfere.

use std::sync::Arc;

use dbx_protocol::{OperationError, OperationResult, RequestContext};
use tracing::{debug, error, info};

use crate::cli::{CliCredential, CliCredentialSource};
use crate::client::{Credential, IdentitySource, WorkspaceClient};
use crate::oauth::ServicePrincipalSession;
use crate::settings::{DeploymentContext, WorkspaceSettings};

pub const MISSING_HOST: &str = "DATABRICKS_HOST environment variable not found";
pub const MISSING_CONSENT: &str = "Unable to authenticate with Databricks. Ensure user authorization is enabled for this app and the user has granted consent.";
pub const NO_CLI_SESSION: &str = "Unable to authenticate with Databricks. Please run 'databricks auth login' for local development.";
pub const NO_SERVICE_PRINCIPAL: &str = "App service principal not available for job submission. Check app configuration.";

/// Label reported with privileged operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    AppServicePrincipal,
    CliAuthentication,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppServicePrincipal => "app_service_principal",
            Self::CliAuthentication => "cli_authentication",
        }
    }
}

/// Load the CLI credential on the blocking pool (it may spawn the CLI).
async fn load_cli(cli: &Arc<dyn CliCredentialSource>) -> OperationResult<CliCredential> {
    let source = Arc::clone(cli);
    let loaded = tokio::task::spawn_blocking(move || source.load())
        .await
        .map_err(|e| OperationError::authorization(format!("{NO_CLI_SESSION} ({e})")))?;

    loaded.map_err(|e| {
        error!("CLI authentication failed: {e}");
        OperationError::authorization(format!("{NO_CLI_SESSION} ({e})"))
    })
}

fn cli_client(credential: CliCredential, http: &reqwest::Client) -> WorkspaceClient {
    WorkspaceClient::new(
        credential.host,
        Credential::Bearer(credential.token),
        IdentitySource::CliProfile {
            profile: credential.profile,
        },
        http.clone(),
    )
}

/// Resolves the per-request, user-scoped client.
pub struct CredentialResolver {
    settings: Arc<WorkspaceSettings>,
    cli: Arc<dyn CliCredentialSource>,
    http: reqwest::Client,
}

impl CredentialResolver {
    pub fn new(
        settings: Arc<WorkspaceSettings>,
        cli: Arc<dyn CliCredentialSource>,
        http: reqwest::Client,
    ) -> Self {
        Self { settings, cli, http }
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    /// Build a fresh client for this request.
    pub async fn resolve_client(&self, ctx: &RequestContext) -> OperationResult<WorkspaceClient> {
        let deployment = self.settings.deployment();

        match (&ctx.forwarded_token, deployment) {
            (Some(token), DeploymentContext::HostedApp) => {
                info!("Using user authorization token from x-forwarded-access-token header");
                let host = self.settings.host.as_ref().ok_or_else(|| {
                    error!("{MISSING_HOST}");
                    OperationError::configuration(MISSING_HOST)
                })?;
                Ok(WorkspaceClient::new(
                    host.clone(),
                    Credential::Bearer(token.clone()),
                    IdentitySource::ForwardedUser,
                    self.http.clone(),
                ))
            }
            (_, DeploymentContext::LocalDevelopment) => {
                debug!(request_id = %ctx.request_id, "Local development detected, using CLI authentication");
                let credential = load_cli(&self.cli).await?;
                info!("Created CLI-authenticated client for profile {}", credential.profile);
                Ok(cli_client(credential, &self.http))
            }
            (None, DeploymentContext::HostedApp) => {
                error!("Running as a hosted app but no user access token was forwarded");
                Err(OperationError::authorization(MISSING_CONSENT))
            }
        }
    }
}

/// Resolves the privileged client used for job submission.
pub struct PrivilegedResolver {
    settings: Arc<WorkspaceSettings>,
    service_principal: Option<Arc<ServicePrincipalSession>>,
    cli: Arc<dyn CliCredentialSource>,
    http: reqwest::Client,
}

impl PrivilegedResolver {
    pub fn new(
        settings: Arc<WorkspaceSettings>,
        service_principal: Option<Arc<ServicePrincipalSession>>,
        cli: Arc<dyn CliCredentialSource>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            settings,
            service_principal,
            cli,
            http,
        }
    }

    pub fn service_principal_available(&self) -> bool {
        self.service_principal.is_some()
    }

    /// Build a fresh privileged client. The forwarded token never
    /// influences the choice.
    pub async fn resolve_client(&self, ctx: &RequestContext) -> OperationResult<(WorkspaceClient, AuthMethod)> {
        if let Some(session) = &self.service_principal {
            debug!(request_id = %ctx.request_id, "Using app service principal");
            let client = WorkspaceClient::new(
                session.host(),
                Credential::ServicePrincipal(Arc::clone(session)),
                IdentitySource::ServicePrincipal,
                self.http.clone(),
            );
            return Ok((client, AuthMethod::AppServicePrincipal));
        }

        if self.settings.deployment().is_hosted() {
            error!("{NO_SERVICE_PRINCIPAL}");
            return Err(OperationError::authorization(NO_SERVICE_PRINCIPAL));
        }

        info!("Using CLI authentication for privileged operation (local development)");
        let credential = load_cli(&self.cli).await?;
        Ok((cli_client(credential, &self.http), AuthMethod::CliAuthentication))
    }
}
