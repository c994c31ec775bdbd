//! Locally configured CLI credentials.
//!
//! Reads a profile from the Databricks CLI config file. Profiles holding a
//! personal access token are used directly; OAuth profiles (`auth_type =
//! databricks-cli`, or no token at all) get a fresh token from
//! `databricks auth token --profile <name>`.

use std::collections::HashMap;
use std::process::Command;

use secrecy::SecretString;
use serde::Deserialize;
use tracing::debug;

use crate::error::CredentialError;
use crate::settings::{CliSettings, normalize_host};

/// A credential obtained from the local CLI session.
#[derive(Debug, Clone)]
pub struct CliCredential {
    pub profile: String,
    pub host: String,
    pub token: SecretString,
}

/// Source of CLI credentials. Loading may touch the filesystem or spawn a
/// process, so resolvers call it on the blocking pool.
pub trait CliCredentialSource: Send + Sync {
    fn load(&self) -> Result<CliCredential, CredentialError>;
}

/// Reads `~/.databrickscfg`-style profile files.
pub struct ConfigFileCliSource {
    settings: CliSettings,
}

impl ConfigFileCliSource {
    pub fn new(settings: CliSettings) -> Self {
        Self { settings }
    }

    fn mint_token(&self, profile: &str) -> Result<SecretString, CredentialError> {
        debug!("Requesting token from {} for profile {profile}", self.settings.cli_path);
        let output = Command::new(&self.settings.cli_path)
            .args(["auth", "token", "--profile", profile])
            .output()
            .map_err(|e| CredentialError::CliCommand(format!("{}: {e}", self.settings.cli_path)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CredentialError::CliCommand(if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            }));
        }

        let parsed: CliTokenOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| CredentialError::CliCommand(format!("unexpected output: {e}")))?;
        Ok(SecretString::from(parsed.access_token))
    }
}

impl CliCredentialSource for ConfigFileCliSource {
    fn load(&self) -> Result<CliCredential, CredentialError> {
        let path = &self.settings.config_file;
        let profile_name = &self.settings.profile;

        let content = std::fs::read_to_string(path).map_err(|source| CredentialError::ConfigFile {
            path: path.clone(),
            source,
        })?;

        let mut profiles = parse_profiles(&content);
        let profile = profiles
            .remove(profile_name)
            .ok_or_else(|| CredentialError::ProfileNotFound {
                profile: profile_name.clone(),
                path: path.clone(),
            })?;

        let host = profile
            .get("host")
            .filter(|h| !h.is_empty())
            .map(|h| normalize_host(h))
            .ok_or_else(|| CredentialError::MissingHost {
                profile: profile_name.clone(),
            })?;

        let uses_cli_oauth = profile.get("auth_type").is_some_and(|t| t == "databricks-cli");
        let token = match profile.get("token").filter(|t| !t.is_empty()) {
            Some(token) if !uses_cli_oauth => SecretString::from(token.clone()),
            _ => self.mint_token(profile_name)?,
        };

        Ok(CliCredential {
            profile: profile_name.clone(),
            host,
            token,
        })
    }
}

#[derive(Deserialize)]
struct CliTokenOutput {
    access_token: String,
}

/// Parse an INI-style profile file into `section → key → value`.
/// Keys are lower-cased; `;` and `#` start comment lines.
pub fn parse_profiles(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut profiles: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = section.trim().to_string();
            profiles.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        let (Some(section), Some((key, value))) = (&current, line.split_once('=')) else {
            continue;
        };
        profiles
            .entry(section.clone())
            .or_default()
            .insert(key.trim().to_lowercase(), value.trim().to_string());
    }

    profiles
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    const CONFIG: &str = "\
; comment
[DEFAULT]
host  = https://adb-111.azuredatabricks.net/
token = dapi-default

[dev]
host = adb-222.azuredatabricks.net
Token = dapi-dev

[oauth]
host = https://adb-333.azuredatabricks.net
auth_type = databricks-cli

[nohost]
token = dapi-x
";

    fn source_for(content: &str, profile: &str, cli_path: &str) -> (tempfile::NamedTempFile, ConfigFileCliSource) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let source = ConfigFileCliSource::new(CliSettings {
            config_file: file.path().to_path_buf(),
            profile: profile.into(),
            cli_path: cli_path.into(),
        });
        (file, source)
    }

    #[test]
    fn parses_sections_and_lowercases_keys() {
        let profiles = parse_profiles(CONFIG);
        assert_eq!(profiles.len(), 4);
        assert_eq!(profiles["dev"]["token"], "dapi-dev");
        assert_eq!(profiles["oauth"]["auth_type"], "databricks-cli");
    }

    #[test]
    fn loads_default_profile_token() {
        let (_file, source) = source_for(CONFIG, "DEFAULT", "databricks");
        let cred = source.load().unwrap();
        assert_eq!(cred.host, "https://adb-111.azuredatabricks.net");
        assert_eq!(cred.token.expose_secret(), "dapi-default");
        assert_eq!(cred.profile, "DEFAULT");
    }

    #[test]
    fn named_profile_host_gets_scheme() {
        let (_file, source) = source_for(CONFIG, "dev", "databricks");
        let cred = source.load().unwrap();
        assert_eq!(cred.host, "https://adb-222.azuredatabricks.net");
    }

    #[test]
    fn missing_file_is_reported() {
        let source = ConfigFileCliSource::new(CliSettings {
            config_file: "/nonexistent/.databrickscfg".into(),
            ..CliSettings::default()
        });
        assert!(matches!(source.load(), Err(CredentialError::ConfigFile { .. })));
    }

    #[test]
    fn missing_profile_and_host_are_reported() {
        let (_file, source) = source_for(CONFIG, "prod", "databricks");
        assert!(matches!(source.load(), Err(CredentialError::ProfileNotFound { .. })));

        let (_file, source) = source_for(CONFIG, "nohost", "databricks");
        assert!(matches!(source.load(), Err(CredentialError::MissingHost { .. })));
    }

    #[test]
    fn oauth_profile_without_cli_binary_fails() {
        let (_file, source) = source_for(CONFIG, "oauth", "/nonexistent/databricks-cli");
        match source.load() {
            Err(CredentialError::CliCommand(msg)) => assert!(msg.contains("/nonexistent/databricks-cli")),
            other => panic!("expected CLI failure, got {other:?}"),
        }
    }
}
