//! Model serving service: chat calls to serving endpoints as the
//! requesting user.

use std::sync::Arc;

use dbx_protocol::{HandlerResult, Methods, OperationError, OperationResult, RequestContext, RpcError};
use dbx_workspace::{ChatMessage, ChatRequest, ChatRole, CredentialResolver, WorkspaceApi};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::telemetry::{Telemetry, log_types};
use crate::{Service, parse_params, timestamp};

const DEFAULT_PROMPT: &str = "Hello, can you help me?";

pub struct ServingService {
    resolver: Arc<CredentialResolver>,
    telemetry: Telemetry,
}

impl ServingService {
    pub fn new(resolver: Arc<CredentialResolver>, telemetry: Telemetry) -> Self {
        Self { resolver, telemetry }
    }

    async fn query(&self, p: ServingQueryParams, ctx: &RequestContext) -> OperationResult<Value> {
        let endpoint_name = p.endpoint_name.trim().to_string();
        if endpoint_name.is_empty() {
            return Err(OperationError::invalid_input("Endpoint name cannot be empty"));
        }
        let inputs = p.inputs.unwrap_or_default();

        let client = self.resolver.resolve_client(ctx).await?;
        info!("Calling model serving endpoint {endpoint_name} as {:?}", client.identity());

        let request = chat_request(&inputs);
        let result = client.query_endpoint(&endpoint_name, &request).await?;

        self.telemetry
            .record(
                log_types::MODEL_SERVING,
                json!({
                    "timestamp": timestamp(),
                    "event": "model_serving_called",
                    "endpoint_name": endpoint_name,
                    "input_keys": inputs.keys().collect::<Vec<_>>(),
                    "response_received": true,
                }),
            )
            .await;

        Ok(json!({
            "success": true,
            "endpointName": endpoint_name,
            "timestamp": timestamp(),
            "result": result,
        }))
    }
}

impl Service for ServingService {
    fn namespace(&self) -> &str {
        "serving"
    }

    async fn handle(&self, method: &str, params: Option<Value>, ctx: &RequestContext) -> HandlerResult {
        match method {
            Methods::SERVING_QUERY => {
                let p: ServingQueryParams = parse_params(params)?;
                let result = self.query(p, ctx).await;
                Ok(self.telemetry.settle("call_model_serving", result).await)
            }
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServingQueryParams {
    #[serde(default)]
    endpoint_name: String,
    #[serde(default)]
    inputs: Option<Map<String, Value>>,
}

fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Build the chat payload from free-form inputs.
///
/// `messages` wins over `prompt`/`content`; with neither, a default user
/// message is sent. Only the `user` role is kept, every other role is sent
/// as `system`.
fn chat_request(inputs: &Map<String, Value>) -> ChatRequest {
    let listed: Vec<ChatMessage> = inputs
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .map(|m| ChatMessage {
                    role: match m.get("role").and_then(Value::as_str).unwrap_or("user") {
                        "user" => ChatRole::User,
                        _ => ChatRole::System,
                    },
                    content: text_of(m.get("content")).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    let messages = if !listed.is_empty() {
        listed
    } else {
        let content = text_of(inputs.get("prompt"))
            .filter(|s| !s.is_empty())
            .or_else(|| text_of(inputs.get("content")).filter(|s| !s.is_empty()))
            .unwrap_or_else(|| DEFAULT_PROMPT.to_string());
        vec![ChatMessage {
            role: ChatRole::User,
            content,
        }]
    };

    ChatRequest {
        messages,
        max_tokens: inputs
            .get("max_tokens")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        temperature: inputs.get("temperature").and_then(Value::as_f64),
        top_p: inputs.get("top_p").and_then(Value::as_f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn listed_messages_keep_only_user_role() {
        let req = chat_request(&inputs(json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "assistant", "content": "ok"},
                {"content": "hi"}
            ]
        })));
        let roles: Vec<_> = req.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ChatRole::System, ChatRole::System, ChatRole::User]);
        assert_eq!(req.messages[2].content, "hi");
    }

    #[test]
    fn prompt_then_content_then_default() {
        let req = chat_request(&inputs(json!({"prompt": "p", "content": "c"})));
        assert_eq!(req.messages[0].content, "p");

        let req = chat_request(&inputs(json!({"content": "c"})));
        assert_eq!(req.messages[0].content, "c");

        let req = chat_request(&inputs(json!({"messages": []})));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, ChatRole::User);
        assert_eq!(req.messages[0].content, DEFAULT_PROMPT);
    }

    #[test]
    fn generation_parameters_pass_through() {
        let req = chat_request(&inputs(json!({"max_tokens": 64, "temperature": 0.2, "top_p": 0.9})));
        assert_eq!(req.max_tokens, Some(64));
        assert_eq!(req.temperature, Some(0.2));
        assert_eq!(req.top_p, Some(0.9));
    }
}
