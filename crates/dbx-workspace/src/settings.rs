//! Workspace settings: the explicit configuration value passed into every
//! credential resolution.

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

/// Where the app is running.
///
/// Derived from the app-name marker the hosting platform injects. This is a
/// deployment heuristic, not an identity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentContext {
    HostedApp,
    LocalDevelopment,
}

impl DeploymentContext {
    /// A present marker means hosted, even when it is blank.
    pub fn from_app_name(app_name: Option<&str>) -> Self {
        match app_name {
            Some(_) => Self::HostedApp,
            None => Self::LocalDevelopment,
        }
    }

    pub fn is_hosted(&self) -> bool {
        matches!(self, Self::HostedApp)
    }
}

/// Client id / secret pair of the app's service principal.
#[derive(Debug, Clone)]
pub struct ServicePrincipalCredentials {
    pub client_id: String,
    pub client_secret: SecretString,
}

impl ServicePrincipalCredentials {
    /// Both halves must be present and non-blank.
    pub fn from_parts(client_id: Option<String>, client_secret: Option<SecretString>) -> Option<Self> {
        let client_id = non_blank(client_id)?;
        let client_secret = client_secret.filter(|s| !s.expose_secret().trim().is_empty())?;
        Some(Self {
            client_id,
            client_secret,
        })
    }
}

/// Which CLI profile to use in local development.
#[derive(Debug, Clone)]
pub struct CliSettings {
    /// Path of the INI-style profile file (`~/.databrickscfg`).
    pub config_file: PathBuf,
    /// Profile section name.
    pub profile: String,
    /// CLI binary used to mint tokens for OAuth profiles.
    pub cli_path: String,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(".databrickscfg"),
            profile: "DEFAULT".into(),
            cli_path: "databricks".into(),
        }
    }
}

/// Everything credential resolution needs to know about the deployment.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceSettings {
    /// Workspace URL, normalised to `https://host` without a trailing slash.
    pub host: Option<String>,
    /// App-name marker; present only inside the hosting platform.
    pub app_name: Option<String>,
    pub workspace_id: Option<String>,
    pub service_principal: Option<ServicePrincipalCredentials>,
    pub default_warehouse_id: Option<String>,
    pub cli: CliSettings,
}

impl WorkspaceSettings {
    pub fn deployment(&self) -> DeploymentContext {
        DeploymentContext::from_app_name(self.app_name.as_deref())
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = non_blank(host).map(|h| normalize_host(&h));
        self
    }

    /// Unlike the other fields a blank value is kept: the platform sets the
    /// marker, so its presence alone selects hosted mode.
    pub fn with_app_name(mut self, app_name: Option<String>) -> Self {
        self.app_name = app_name.map(|name| name.trim().to_string());
        if self.app_name.as_deref() == Some("") {
            warn!("DATABRICKS_APP_NAME is set but empty; running in hosted mode");
        }
        self
    }

    pub fn with_workspace_id(mut self, workspace_id: Option<String>) -> Self {
        self.workspace_id = non_blank(workspace_id);
        self
    }

    pub fn with_service_principal(mut self, sp: Option<ServicePrincipalCredentials>) -> Self {
        self.service_principal = sp;
        self
    }

    pub fn with_default_warehouse(mut self, warehouse_id: Option<String>) -> Self {
        self.default_warehouse_id = non_blank(warehouse_id);
        self
    }

    pub fn with_cli(mut self, cli: CliSettings) -> Self {
        self.cli = cli;
        self
    }

    /// App name for reporting; `local-dev` outside the platform.
    pub fn app_name_or_default(&self) -> &str {
        self.app_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or("local-dev")
    }

    pub fn workspace_id_or_default(&self) -> &str {
        self.workspace_id.as_deref().unwrap_or("unknown")
    }
}

/// Add `https://` when no scheme is given and drop trailing slashes.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_follows_app_name_marker() {
        assert_eq!(DeploymentContext::from_app_name(Some("my-app")), DeploymentContext::HostedApp);
        assert_eq!(DeploymentContext::from_app_name(Some("")), DeploymentContext::HostedApp);
        assert_eq!(DeploymentContext::from_app_name(None), DeploymentContext::LocalDevelopment);
    }

    #[test]
    fn blank_app_name_marker_still_means_hosted() {
        let settings = WorkspaceSettings::default().with_app_name(Some("  ".into()));
        assert_eq!(settings.app_name.as_deref(), Some(""));
        assert!(settings.deployment().is_hosted());
        assert_eq!(settings.app_name_or_default(), "local-dev");
    }

    #[test]
    fn host_normalisation() {
        assert_eq!(normalize_host("adb-1.azuredatabricks.net"), "https://adb-1.azuredatabricks.net");
        assert_eq!(normalize_host("https://adb-1.azuredatabricks.net/"), "https://adb-1.azuredatabricks.net");
        assert_eq!(normalize_host("http://127.0.0.1:9000"), "http://127.0.0.1:9000");
    }

    #[test]
    fn service_principal_requires_both_halves() {
        assert!(ServicePrincipalCredentials::from_parts(Some("id".into()), None).is_none());
        assert!(
            ServicePrincipalCredentials::from_parts(None, Some(SecretString::from("s"))).is_none()
        );
        assert!(
            ServicePrincipalCredentials::from_parts(Some("id".into()), Some(SecretString::from(" ")))
                .is_none()
        );
        let sp = ServicePrincipalCredentials::from_parts(Some("id".into()), Some(SecretString::from("s")))
            .unwrap();
        assert_eq!(sp.client_id, "id");
    }

    #[test]
    fn blank_settings_are_absent() {
        let settings = WorkspaceSettings::default()
            .with_host(Some("".into()))
            .with_default_warehouse(Some("".into()));
        assert!(settings.host.is_none());
        assert!(settings.default_warehouse_id.is_none());
        assert_eq!(settings.app_name_or_default(), "local-dev");
        assert!(!settings.deployment().is_hosted());
        assert_eq!(settings.workspace_id_or_default(), "unknown");
    }
}
