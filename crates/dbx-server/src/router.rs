//! Gateway router: dispatches JSON-RPC requests to services.

use std::future::Future;
use std::pin::Pin;

use dbx_protocol::methods::namespace_of;
use dbx_protocol::{HandlerResult, RequestContext, RpcError};
use dbx_services::Service;
use dbx_transport::RequestHandler;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type InitResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The app server: owns services and routes requests.
pub struct AppServer {
    /// Registered services (boxed for object safety)
    services: Vec<Box<dyn ServiceDyn>>,
    /// Server state
    state: RwLock<ServerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Uninitialized,
    Running,
    Shutdown,
}

/// Object-safe wrapper for the Service trait.
trait ServiceDyn: Send + Sync {
    fn namespace_dyn(&self) -> &str;
    fn handle_dyn<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
        ctx: &'a RequestContext,
    ) -> BoxFuture<'a, HandlerResult>;
    fn init_dyn(&self) -> BoxFuture<'_, InitResult>;
    fn shutdown_dyn(&self) -> BoxFuture<'_, ()>;
}

impl<T: Service> ServiceDyn for T {
    fn namespace_dyn(&self) -> &str {
        self.namespace()
    }
    fn handle_dyn<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
        ctx: &'a RequestContext,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(self.handle(method, params, ctx))
    }
    fn init_dyn(&self) -> BoxFuture<'_, InitResult> {
        Box::pin(self.init())
    }
    fn shutdown_dyn(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.shutdown())
    }
}

impl Default for AppServer {
    fn default() -> Self {
        Self::new()
    }
}

impl AppServer {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            state: RwLock::new(ServerState::Uninitialized),
        }
    }

    /// Register a service with the server.
    pub fn register_service<S: Service + 'static>(&mut self, service: S) {
        info!("Registering service: {}", service.namespace());
        self.services.push(Box::new(service));
    }

    pub fn namespaces(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.namespace_dyn()).collect()
    }

    /// Initialize all services.
    pub async fn initialize(&self) -> InitResult {
        for service in &self.services {
            service.init_dyn().await?;
        }

        *self.state.write() = ServerState::Running;
        info!("Gateway server initialized ({} services)", self.services.len());
        Ok(())
    }

    /// Shutdown all services. Requests arriving afterwards are rejected.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state == ServerState::Shutdown {
                return;
            }
            *state = ServerState::Shutdown;
        }

        info!("Shutting down gateway server...");
        for service in &self.services {
            service.shutdown_dyn().await;
        }
        info!("Gateway server shutdown complete");
    }

    /// Route a request to the service owning its namespace.
    async fn route_request(&self, method: &str, params: Option<Value>, ctx: &RequestContext) -> HandlerResult {
        let namespace = namespace_of(method);

        match self.services.iter().find(|s| s.namespace_dyn() == namespace) {
            Some(service) => service.handle_dyn(method, params, ctx).await,
            None => {
                warn!(request_id = %ctx.request_id, "No service for method {method}");
                Err(RpcError::method_not_found(method))
            }
        }
    }
}

impl RequestHandler for AppServer {
    async fn handle_request(&self, method: &str, params: Option<Value>, ctx: &RequestContext) -> HandlerResult {
        // Check server state
        let state = *self.state.read();
        match state {
            ServerState::Shutdown => return Err(RpcError::shutting_down()),
            ServerState::Uninitialized => return Err(RpcError::not_initialized()),
            ServerState::Running => {}
        }

        self.route_request(method, params, ctx).await
    }
}
