//! Gateway server: routes JSON-RPC requests to services.
//!
//! The server owns all services, tracks lifecycle state and provides the
//! `RequestHandler` implementation for the transport layer.

pub mod router;

pub use router::AppServer;
