//! Protocol types for the Databricks app gateway.
//!
//! JSON-RPC 2.0 envelopes, method names, the per-request context carried
//! from the HTTP layer down to the services, and the tagged error taxonomy
//! used for operation failures.

pub mod context;
pub mod error;
pub mod jsonrpc;
pub mod methods;
pub mod outcome;

pub use context::RequestContext;
pub use error::{RpcError, RpcErrorCode};
pub use jsonrpc::{HandlerResult, RequestId, RpcRequest, RpcResponse};
pub use methods::Methods;
pub use outcome::{ErrorKind, OperationError, OperationResult};
