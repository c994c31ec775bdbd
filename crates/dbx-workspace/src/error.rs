//! Errors raised while loading or minting credentials.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("cannot read Databricks config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("profile '{profile}' not found in {path}")]
    ProfileNotFound { profile: String, path: PathBuf },

    #[error("profile '{profile}' has no host")]
    MissingHost { profile: String },

    #[error("databricks CLI token command failed: {0}")]
    CliCommand(String),

    #[error("OAuth token request failed: {0}")]
    TokenEndpoint(String),

    #[error("unsupported token type: {0}")]
    UnsupportedTokenType(String),
}
