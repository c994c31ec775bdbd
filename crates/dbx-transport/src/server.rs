//! HTTP transport server using Axum.
//!
//! Accepts JSON-RPC requests on `POST /api/rpc`, builds the per-request
//! context from the platform headers and hands the call to the app server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use dbx_protocol::context::{FORWARDED_ACCESS_TOKEN_HEADER, REQUEST_ID_HEADER};
use dbx_protocol::{HandlerResult, RequestContext, RequestId, RpcError, RpcRequest, RpcResponse};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Trait implemented by the app server to handle incoming requests.
/// The transport layer calls this for every well-formed JSON-RPC request.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a JSON-RPC request and return its result.
    fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> impl std::future::Future<Output = HandlerResult> + Send;
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Enable permissive CORS (browser front ends served from elsewhere)
    pub enable_cors: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            hostname: "0.0.0.0".into(),
            enable_cors: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid listen address {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared state for the transport server.
struct AppState<H: RequestHandler> {
    handler: Arc<H>,
}

/// Build the HTTP router. Exposed so tests can drive it without a socket.
pub fn router<H: RequestHandler>(config: &TransportConfig, handler: Arc<H>) -> Router {
    let state = Arc::new(AppState { handler });

    let app = Router::new()
        .route("/api/rpc", post(rpc_handler::<H>))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.enable_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// The transport server: owns the listener task.
pub struct TransportServer {
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Start the transport server with the given request handler.
    pub async fn start<H: RequestHandler>(config: TransportConfig, handler: H) -> Result<Self, TransportError> {
        Self::start_shared(config, Arc::new(handler)).await
    }

    /// Start with a handler that is also held elsewhere (e.g. for shutdown).
    pub async fn start_shared<H: RequestHandler>(
        config: TransportConfig,
        handler: Arc<H>,
    ) -> Result<Self, TransportError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let app = router(&config, handler);

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!("Gateway listening on http://{}:{}/api/rpc", config.hostname, actual_port);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gracefully stop the server, waiting for in-flight requests.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Gateway transport stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn rpc_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<RpcResponse> {
    let ctx = request_context(&headers);
    Json(handle_message(&body, &state.handler, &ctx).await)
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Build the request context. A missing request id gets a fresh UUID; a
/// blank forwarded token counts as absent.
fn request_context(headers: &HeaderMap) -> RequestContext {
    let request_id = header_value(headers, REQUEST_ID_HEADER)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    RequestContext::new(request_id).with_forwarded_token(header_value(headers, FORWARDED_ACCESS_TOKEN_HEADER))
}

async fn handle_message<H: RequestHandler>(body: &[u8], handler: &Arc<H>, ctx: &RequestContext) -> RpcResponse {
    let parsed: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return RpcResponse::error(None, RpcError::parse_error("Failed to parse JSON")),
    };

    // Keep the id for the error reply even when the envelope is malformed
    let id: Option<RequestId> = parsed.get("id").cloned().and_then(|v| serde_json::from_value(v).ok());
    let request = match serde_json::from_value::<RpcRequest>(parsed) {
        Ok(req) if req.is_valid() => req,
        _ => return RpcResponse::error(id, RpcError::invalid_request("Invalid JSON-RPC 2.0 request")),
    };

    debug!(
        request_id = %ctx.request_id,
        forwarded_token = ctx.has_forwarded_token(),
        "Dispatching {}",
        request.method
    );

    let id = request.id;
    match handler.handle_request(&request.method, request.params, ctx).await {
        Ok(result) => RpcResponse::success(id.unwrap_or(RequestId::Number(0)), result),
        Err(err) => RpcResponse::error(id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use secrecy::ExposeSecret;
    use tower::ServiceExt;

    /// Echoes the method and what the context carried.
    struct EchoHandler;

    impl RequestHandler for EchoHandler {
        async fn handle_request(&self, method: &str, params: Option<Value>, ctx: &RequestContext) -> HandlerResult {
            if method == "fail/now" {
                return Err(RpcError::method_not_found(method));
            }
            Ok(json!({
                "method": method,
                "params": params,
                "requestId": ctx.request_id,
                "token": ctx.forwarded_token.as_ref().map(|t| t.expose_secret().to_string()),
            }))
        }
    }

    fn app() -> Router {
        router(&TransportConfig::default(), Arc::new(EchoHandler))
    }

    async fn call(request: Request<Body>) -> (StatusCode, Value) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn rpc() -> axum::http::request::Builder {
        Request::builder()
            .method("POST")
            .uri("/api/rpc")
            .header("content-type", "application/json")
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = call(Request::builder().uri("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn forwards_headers_into_context() {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"app/status"}"#;
        let (status, reply) = call(
            rpc()
                .header("x-forwarded-access-token", "user-tok")
                .header("x-request-id", "req-42")
                .body(Body::from(body))
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["method"], "app/status");
        assert_eq!(reply["result"]["requestId"], "req-42");
        assert_eq!(reply["result"]["token"], "user-tok");
    }

    #[tokio::test]
    async fn blank_token_and_missing_request_id() {
        let body = r#"{"jsonrpc":"2.0","id":"a","method":"log/test","params":{"message":"m"}}"#;
        let (_, reply) = call(
            rpc()
                .header("x-forwarded-access-token", "  ")
                .body(Body::from(body))
                .unwrap(),
        )
        .await;

        assert_eq!(reply["id"], "a");
        assert!(reply["result"]["token"].is_null());
        assert_eq!(reply["result"]["params"]["message"], "m");
        let request_id = reply["result"]["requestId"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(request_id).is_ok());
    }

    #[tokio::test]
    async fn invalid_json_is_parse_error() {
        let (status, reply) = call(rpc().body(Body::from("{not json")).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn missing_version_or_method_is_invalid_request() {
        for body in [r#"{"id":1,"method":"app/status"}"#, r#"{"jsonrpc":"2.0","id":2}"#] {
            let (_, reply) = call(rpc().body(Body::from(body)).unwrap()).await;
            assert_eq!(reply["error"]["code"], -32600);
        }
    }

    #[tokio::test]
    async fn wrong_version_or_non_string_method_keeps_id() {
        for body in [
            r#"{"jsonrpc":"1.0","id":7,"method":"app/status"}"#,
            r#"{"jsonrpc":"2.0","id":7,"method":42}"#,
            r#"{"jsonrpc":"2.0","id":7,"method":""}"#,
        ] {
            let (_, reply) = call(rpc().body(Body::from(body)).unwrap()).await;
            assert_eq!(reply["id"], 7);
            assert_eq!(reply["error"]["code"], -32600);
        }
    }

    #[tokio::test]
    async fn null_params_reach_handler_as_absent() {
        let body = r#"{"jsonrpc":"2.0","id":8,"method":"app/status","params":null}"#;
        let (_, reply) = call(rpc().body(Body::from(body)).unwrap()).await;
        assert!(reply["result"]["params"].is_null());
        assert_eq!(reply["result"]["method"], "app/status");
    }

    #[tokio::test]
    async fn handler_errors_become_error_responses() {
        let body = r#"{"jsonrpc":"2.0","id":3,"method":"fail/now"}"#;
        let (_, reply) = call(rpc().body(Body::from(body)).unwrap()).await;
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn start_binds_and_stops() {
        let config = TransportConfig {
            port: 0,
            hostname: "127.0.0.1".into(),
            enable_cors: true,
        };
        let mut server = TransportServer::start(config, EchoHandler).await.unwrap();
        assert_ne!(server.port(), 0);
        server.stop().await;
    }
}
