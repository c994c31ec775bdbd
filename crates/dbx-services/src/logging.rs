//! Log service: emits a test event locally and to the log sink.

use dbx_protocol::{HandlerResult, Methods, RequestContext, RpcError};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::telemetry::{Telemetry, log_types};
use crate::{Service, parse_optional_params, timestamp};

pub struct LogService {
    telemetry: Telemetry,
}

impl LogService {
    pub fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }

    async fn send_test_log(&self, p: TestLogParams) -> Value {
        let message = p
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "Test log message".into());
        let level = p.level.filter(|l| !l.is_empty()).unwrap_or_else(|| "info".into());

        match level.as_str() {
            "error" => error!("Test error log: {message}"),
            "warning" => warn!("Test warning log: {message}"),
            _ => info!("Test info log: {message}"),
        }

        self.telemetry
            .record(
                log_types::TEST_LOG,
                json!({
                    "timestamp": timestamp(),
                    "event": "test_log_generated",
                    "level": level,
                    "message": message,
                    "endpoint": "rpc",
                }),
            )
            .await;

        json!({
            "success": true,
            "level": level,
            "message": message,
            "timestamp": timestamp(),
        })
    }
}

impl Service for LogService {
    fn namespace(&self) -> &str {
        "log"
    }

    async fn handle(&self, method: &str, params: Option<Value>, _ctx: &RequestContext) -> HandlerResult {
        match method {
            Methods::LOG_TEST => {
                let p: TestLogParams = parse_optional_params(params)?;
                Ok(self.send_test_log(p).await)
            }
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}

#[derive(Deserialize, Default)]
struct TestLogParams {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    level: Option<String>,
}
