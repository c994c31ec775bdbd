//! Databricks workspace access.
//!
//! Decides, per outbound call, which identity reaches the workspace:
//! - the end user's forwarded token (hosted app)
//! - a locally configured CLI profile (local development)
//! - the app's service principal (privileged operations)
//!
//! Settings are an explicit value object handed to the resolvers. Nothing in
//! this crate reads or writes the process environment.

pub mod cli;
pub mod client;
pub mod error;
pub mod oauth;
pub mod resolver;
pub mod settings;

pub use cli::{CliCredential, CliCredentialSource, ConfigFileCliSource};
pub use client::{
    ChatMessage, ChatRequest, ChatRole, Credential, CurrentUser, IdentitySource,
    StatementParameter, StatementRequest, StatementResult, WorkspaceApi, WorkspaceClient,
};
pub use error::CredentialError;
pub use oauth::ServicePrincipalSession;
pub use resolver::{AuthMethod, CredentialResolver, PrivilegedResolver};
pub use settings::{CliSettings, DeploymentContext, ServicePrincipalCredentials, WorkspaceSettings};
