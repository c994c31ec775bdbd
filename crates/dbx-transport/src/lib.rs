//! Gateway transport layer
//!
//! Serves JSON-RPC 2.0 over plain HTTP. The transport handles:
//! - listener lifecycle (bind, serve, graceful stop)
//! - JSON-RPC envelope validation
//! - building the per-request context from platform headers
//!
//! The transport is decoupled from the server logic via the `RequestHandler` trait.

pub mod server;

pub use server::{RequestHandler, TransportConfig, TransportError, TransportServer, router};
