//! Job service: triggers job runs with the app's privileged identity.

use std::collections::BTreeMap;
use std::sync::Arc;

use dbx_protocol::{HandlerResult, Methods, OperationError, OperationResult, RequestContext, RpcError};
use dbx_workspace::{PrivilegedResolver, WorkspaceApi};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::telemetry::{Telemetry, log_types};
use crate::{Service, parse_params, timestamp};

pub struct JobService {
    resolver: Arc<PrivilegedResolver>,
    telemetry: Telemetry,
}

impl JobService {
    pub fn new(resolver: Arc<PrivilegedResolver>, telemetry: Telemetry) -> Self {
        Self { resolver, telemetry }
    }

    async fn submit(&self, p: JobSubmitParams, ctx: &RequestContext) -> OperationResult<Value> {
        let job_id = parse_job_id(p.job_id)?;
        let parameters = job_parameters(p.parameters.unwrap_or_default())?;

        let (client, auth_method) = self.resolver.resolve_client(ctx).await?;
        info!(
            "Submitting job {job_id} with {} and {} parameters",
            auth_method.as_str(),
            parameters.len()
        );

        let run_id = client.run_job(job_id, &parameters).await?;

        self.telemetry
            .record(
                log_types::JOB_SUBMISSION,
                json!({
                    "timestamp": timestamp(),
                    "event": "job_submitted",
                    "job_id": job_id,
                    "run_id": run_id,
                    "parameter_count": parameters.len(),
                    "auth_method": auth_method.as_str(),
                }),
            )
            .await;

        Ok(json!({
            "success": true,
            "jobId": job_id,
            "runId": run_id,
            "parameters": parameters,
            "timestamp": timestamp(),
            "authMethod": auth_method.as_str(),
        }))
    }
}

impl Service for JobService {
    fn namespace(&self) -> &str {
        "job"
    }

    async fn handle(&self, method: &str, params: Option<Value>, ctx: &RequestContext) -> HandlerResult {
        match method {
            Methods::JOB_SUBMIT => {
                let p: JobSubmitParams = parse_params(params)?;
                let result = self.submit(p, ctx).await;
                Ok(self.telemetry.settle("submit_job", result).await)
            }
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Params
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobSubmitParams {
    #[serde(default)]
    job_id: Option<Value>,
    #[serde(default)]
    parameters: Option<Map<String, Value>>,
}

/// Accepts a JSON integer or a numeric string.
fn parse_job_id(raw: Option<Value>) -> OperationResult<u64> {
    let id = match raw {
        None | Some(Value::Null) => return Err(OperationError::invalid_input("Job ID is required")),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| OperationError::invalid_input("Job ID must be an integer"))?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| OperationError::invalid_input("Job ID must be an integer"))?,
        Some(_) => return Err(OperationError::invalid_input("Job ID must be an integer")),
    };

    u64::try_from(id)
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| OperationError::invalid_input("Job ID must be positive"))
}

fn job_parameters(raw: Map<String, Value>) -> OperationResult<BTreeMap<String, String>> {
    raw.into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key, s)),
            _ => Err(OperationError::invalid_input(format!(
                "Job parameter '{key}' must be a string"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbx_protocol::ErrorKind;

    #[test]
    fn job_id_accepts_numbers_and_numeric_strings() {
        assert_eq!(parse_job_id(Some(json!(42))).unwrap(), 42);
        assert_eq!(parse_job_id(Some(json!(" 7 "))).unwrap(), 7);
    }

    #[test]
    fn job_id_must_be_positive() {
        for raw in [json!(0), json!(-3), json!("-1")] {
            let err = parse_job_id(Some(raw)).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidInput);
            assert_eq!(err.message, "Job ID must be positive");
        }
    }

    #[test]
    fn job_id_rejects_non_integers() {
        for raw in [json!(1.5), json!("abc"), json!([1])] {
            assert_eq!(parse_job_id(Some(raw)).unwrap_err().message, "Job ID must be an integer");
        }
        assert_eq!(parse_job_id(None).unwrap_err().message, "Job ID is required");
    }

    #[test]
    fn parameters_must_be_strings() {
        let ok: Map<String, Value> = serde_json::from_value(json!({"env": "dev"})).unwrap();
        assert_eq!(job_parameters(ok).unwrap()["env"], "dev");

        let bad: Map<String, Value> = serde_json::from_value(json!({"count": 3})).unwrap();
        assert_eq!(
            job_parameters(bad).unwrap_err().message,
            "Job parameter 'count' must be a string"
        );
    }
}
