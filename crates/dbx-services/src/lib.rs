//! Gateway service implementations
//!
//! Each service implements the `Service` trait and handles a namespace of
//! JSON-RPC methods. Services are registered with the app server router
//! which dispatches requests by method prefix.
//!
//! Operation failures never escape as protocol errors: they are recorded
//! through [`telemetry::Telemetry`] and returned as `{ success: false, .. }`.

pub mod jobs;
pub mod logging;
pub mod serving;
pub mod sql;
pub mod status;
pub mod telemetry;

use dbx_protocol::{HandlerResult, RequestContext, RpcError};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use jobs::JobService;
pub use logging::LogService;
pub use serving::ServingService;
pub use sql::SqlService;
pub use status::StatusService;
pub use telemetry::{LogAnalyticsSink, Telemetry};

/// Trait implemented by all gateway services.
///
/// Each service handles a namespace of methods (e.g., "sql/*", "job/*").
pub trait Service: Send + Sync {
    /// The namespace prefix this service handles (e.g., "sql", "job").
    fn namespace(&self) -> &str;

    /// Handle a JSON-RPC request within this service's namespace.
    ///
    /// `method` is the full method string (e.g., "sql/execute"). `ctx`
    /// carries the forwarded user token for this request only.
    fn handle(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> impl std::future::Future<Output = HandlerResult> + Send;

    /// Initialize the service (called once at startup).
    fn init(&self) -> impl std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send {
        async { Ok(()) }
    }

    /// Shutdown the service (called once at server shutdown).
    fn shutdown(&self) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }
}

/// Deserialize required params.
pub(crate) fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    match params {
        Some(v) => serde_json::from_value(v).map_err(|e| RpcError::invalid_params(format!("Invalid parameters: {e}"))),
        None => Err(RpcError::invalid_params("Parameters required")),
    }
}

/// Deserialize params that may be omitted entirely.
pub(crate) fn parse_optional_params<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T, RpcError> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v).map_err(|e| RpcError::invalid_params(format!("Invalid parameters: {e}"))),
    }
}

pub(crate) fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
