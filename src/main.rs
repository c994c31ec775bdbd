//! dbx-app: Databricks app gateway
//!
//! A single-process server that exposes SQL warehouse queries, job runs,
//! model-serving calls, test logging and an identity report over JSON-RPC
//! 2.0 on `POST /api/rpc`.
//!
//! Inside the Databricks Apps platform every request carries the end user's
//! token in `x-forwarded-access-token` and calls run as that user. Job runs
//! use the app's service principal. Outside the platform the local CLI
//! profile is used for both.
//!
//! Usage:
//!   dbx-app                                   # Port 8080, settings from the environment
//!   dbx-app --port 9000 --profile dev         # Local development against a CLI profile
//!   dbx-app --log-format json --verbose       # Structured debug logs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use dbx_server::AppServer;
use dbx_services::telemetry::{LogAnalyticsSink, Telemetry, log_types};
use dbx_services::{JobService, LogService, ServingService, SqlService, StatusService};
use dbx_transport::{TransportConfig, TransportServer};
use dbx_workspace::{
    CliSettings, ConfigFileCliSource, Credential, CredentialResolver, IdentitySource, PrivilegedResolver,
    ServicePrincipalCredentials, ServicePrincipalSession, WorkspaceApi, WorkspaceClient, WorkspaceSettings,
};
use secrecy::SecretString;
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const APP_NAME_ENV: &str = "DATABRICKS_APP_NAME";

/// The platform stops the app this long after SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "dbx-app", about = "Databricks app gateway: SQL, jobs, model serving")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, env = "DATABRICKS_APP_PORT", default_value = "8080")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "0.0.0.0")]
    hostname: String,

    /// Workspace URL; the scheme may be omitted
    #[arg(long, env = "DATABRICKS_HOST")]
    host: Option<String>,

    /// App name; set by the platform, marks a hosted deployment
    #[arg(long, env = APP_NAME_ENV)]
    app_name: Option<String>,

    /// Workspace id reported by app/status
    #[arg(long, env = "DATABRICKS_WORKSPACE_ID")]
    workspace_id: Option<String>,

    /// Service principal client id
    #[arg(long, env = "DATABRICKS_CLIENT_ID")]
    client_id: Option<String>,

    /// Service principal client secret
    #[arg(long, env = "DATABRICKS_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Default SQL warehouse for sql/execute
    #[arg(long, env = "SQL_WAREHOUSE_ID")]
    warehouse_id: Option<String>,

    /// Job id front ends pre-fill for job/submit
    #[arg(long, env = "DEFAULT_JOB_ID")]
    default_job_id: Option<String>,

    /// CLI profile file (defaults to ~/.databrickscfg)
    #[arg(long, env = "DATABRICKS_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// CLI profile used in local development
    #[arg(long, env = "DATABRICKS_CONFIG_PROFILE", default_value = "DEFAULT")]
    profile: String,

    /// Databricks CLI binary, used to mint tokens for OAuth profiles
    #[arg(long, env = "DATABRICKS_CLI_PATH", default_value = "databricks")]
    cli_path: String,

    /// Azure Log Analytics workspace id
    #[arg(long, env = "AZURE_LOG_ANALYTICS_WORKSPACE_ID")]
    log_analytics_workspace_id: Option<String>,

    /// Azure Log Analytics shared key
    #[arg(long, env = "AZURE_LOG_ANALYTICS_SHARED_KEY", hide_env_values = true)]
    log_analytics_shared_key: Option<String>,

    /// Timeout for outbound HTTP calls, in seconds
    #[arg(long, default_value = "60")]
    request_timeout_secs: u64,

    /// Enable permissive CORS on the RPC endpoint
    #[arg(long)]
    cors: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Log line format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Append logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn workspace_settings(&self) -> WorkspaceSettings {
        let config_file = self.config_file.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".databrickscfg")
        });

        // An empty marker still counts; clap may drop empty env values
        let app_name = self
            .app_name
            .clone()
            .or_else(|| std::env::var_os(APP_NAME_ENV).map(|_| String::new()));

        WorkspaceSettings::default()
            .with_host(self.host.clone())
            .with_app_name(app_name)
            .with_workspace_id(self.workspace_id.clone())
            .with_default_warehouse(self.warehouse_id.clone())
            .with_service_principal(ServicePrincipalCredentials::from_parts(
                self.client_id.clone(),
                self.client_secret.clone().map(SecretString::from),
            ))
            .with_cli(CliSettings {
                config_file,
                profile: self.profile.clone(),
                cli_path: self.cli_path.clone(),
            })
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if let Some(path) = &cli.log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let writer = std::sync::Mutex::new(file);

        match cli.log_format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init(),
        }
        eprintln!("Logging to {}", path.display());
    } else {
        match cli.log_format {
            LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        }
    }
    Ok(())
}

/// Build the service principal session and check it against the workspace.
/// Returns `None` (user authorization only) when it is not configured or
/// cannot authenticate.
async fn connect_service_principal(
    settings: &WorkspaceSettings,
    http: &reqwest::Client,
    telemetry: &Telemetry,
) -> Option<Arc<ServicePrincipalSession>> {
    let credentials = settings.service_principal.clone()?;
    let Some(host) = settings.host.clone() else {
        warn!("Service principal credentials set but DATABRICKS_HOST is missing; using user authorization only");
        return None;
    };

    let session = Arc::new(ServicePrincipalSession::new(host.clone(), credentials, http.clone()));
    let client = WorkspaceClient::new(
        host.clone(),
        Credential::ServicePrincipal(Arc::clone(&session)),
        IdentitySource::ServicePrincipal,
        http.clone(),
    );

    match client.current_user().await {
        Ok(user) => {
            info!("Connected to Databricks as app service principal {}", user.user_name);
            telemetry
                .record(
                    log_types::CONNECTION,
                    json!({
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                        "event": "databricks_client_initialized",
                        "auth_type": "app_service_principal",
                        "service_principal": user.user_name,
                        "host": host,
                    }),
                )
                .await;
            Some(session)
        }
        Err(e) => {
            warn!("App service principal unavailable, using user authorization only: {e}");
            telemetry
                .record(
                    log_types::WARNING,
                    json!({
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                        "event": "app_client_setup_failed",
                        "message": e.message,
                        "note": "Will use user authorization for all operations",
                    }),
                )
                .await;
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cli.request_timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let telemetry = Telemetry::new(LogAnalyticsSink::from_parts(
        cli.log_analytics_workspace_id.clone(),
        cli.log_analytics_shared_key.clone().map(SecretString::from),
        http.clone(),
    ));

    let settings = Arc::new(cli.workspace_settings());
    info!(
        "Starting {} in workspace {} ({:?})",
        settings.app_name_or_default(),
        settings.workspace_id_or_default(),
        settings.deployment()
    );

    let service_principal = connect_service_principal(&settings, &http, &telemetry).await;
    let cli_source = Arc::new(ConfigFileCliSource::new(settings.cli.clone()));

    let resolver = Arc::new(CredentialResolver::new(settings.clone(), cli_source.clone(), http.clone()));
    let privileged = Arc::new(PrivilegedResolver::new(
        settings.clone(),
        service_principal,
        cli_source,
        http.clone(),
    ));

    let mut server = AppServer::new();
    server.register_service(SqlService::new(resolver.clone(), telemetry.clone()));
    server.register_service(JobService::new(privileged.clone(), telemetry.clone()));
    server.register_service(ServingService::new(resolver.clone(), telemetry.clone()));
    server.register_service(LogService::new(telemetry.clone()));
    server.register_service(
        StatusService::new(resolver, privileged, telemetry.clone()).with_default_job_id(cli.default_job_id.clone()),
    );

    server
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize services: {e}"))?;
    let server = Arc::new(server);

    let transport_config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        enable_cors: cli.cors,
    };
    let mut transport = TransportServer::start_shared(transport_config, server.clone())
        .await
        .context("failed to start transport")?;

    println!();
    println!("  dbx-app {}", env!("CARGO_PKG_VERSION"));
    println!("  App:        {}", settings.app_name_or_default());
    println!("  Workspace:  {}", settings.workspace_id_or_default());
    println!("  Endpoint:   http://{}:{}/api/rpc", cli.hostname, transport.port());
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    shutdown_signal().await;

    telemetry
        .record(
            log_types::SHUTDOWN,
            json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "event": "app_shutdown",
                "app_name": settings.app_name_or_default(),
            }),
        )
        .await;

    if tokio::time::timeout(SHUTDOWN_GRACE, transport.stop()).await.is_err() {
        warn!("Transport did not stop within {}s", SHUTDOWN_GRACE.as_secs());
    }
    server.shutdown().await;

    info!("Server stopped");
    Ok(())
}
