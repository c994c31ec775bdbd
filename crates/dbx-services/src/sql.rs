//! SQL service: parameterised statements against a SQL warehouse, run as
//! the requesting user.

use std::collections::HashSet;
use std::sync::Arc;

use dbx_protocol::{HandlerResult, Methods, OperationError, OperationResult, RequestContext, RpcError};
use dbx_workspace::{CredentialResolver, StatementParameter, StatementRequest, StatementResult, WorkspaceApi};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::telemetry::{Telemetry, log_types};
use crate::{Service, parse_params, timestamp};

pub struct SqlService {
    resolver: Arc<CredentialResolver>,
    telemetry: Telemetry,
}

impl SqlService {
    pub fn new(resolver: Arc<CredentialResolver>, telemetry: Telemetry) -> Self {
        Self { resolver, telemetry }
    }

    async fn execute(&self, p: SqlExecuteParams, ctx: &RequestContext) -> OperationResult<Value> {
        let query = p.query.trim();
        if query.is_empty() {
            return Err(OperationError::invalid_input("Query template cannot be empty"));
        }
        if !looks_parameterised(query) {
            warn!("Query template should use parameters to prevent SQL injection");
        }

        let warehouse_id = p
            .warehouse_id
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty())
            .or_else(|| self.resolver.settings().default_warehouse_id.clone())
            .ok_or_else(|| OperationError::configuration("SQL warehouse ID is required"))?;

        let client = self.resolver.resolve_client(ctx).await?;

        let parameters = statement_parameters(p.parameters.unwrap_or_default());
        info!(
            "Executing SQL query as {:?} with {} parameters",
            client.identity(),
            parameters.len()
        );
        let parameter_count = parameters.len();

        let result = client
            .execute_sql(&StatementRequest {
                statement: query.to_string(),
                warehouse_id: warehouse_id.clone(),
                parameters,
            })
            .await?;

        self.telemetry
            .record(
                log_types::SQL_QUERY,
                json!({
                    "timestamp": timestamp(),
                    "event": "sql_query_executed",
                    "warehouse_id": warehouse_id,
                    "statement_id": result.statement_id,
                    "parameter_count": parameter_count,
                    "row_count": result.rows.len(),
                }),
            )
            .await;

        Ok(shape_result(result))
    }
}

impl Service for SqlService {
    fn namespace(&self) -> &str {
        "sql"
    }

    async fn handle(&self, method: &str, params: Option<Value>, ctx: &RequestContext) -> HandlerResult {
        match method {
            Methods::SQL_EXECUTE => {
                let p: SqlExecuteParams = parse_params(params)?;
                let result = self.execute(p, ctx).await;
                Ok(self.telemetry.settle("execute_sql_query", result).await)
            }
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Params and shaping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SqlExecuteParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    parameters: Option<Map<String, Value>>,
    #[serde(default)]
    warehouse_id: Option<String>,
}

fn looks_parameterised(query: &str) -> bool {
    query.contains(':') || query.contains("${") || query.contains("{{")
}

/// Statement parameters travel as strings; JSON strings are sent verbatim.
fn statement_parameters(params: Map<String, Value>) -> Vec<StatementParameter> {
    params
        .into_iter()
        .map(|(name, value)| StatementParameter {
            name,
            value: match value {
                Value::Null => None,
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            },
        })
        .collect()
}

/// Suffix repeated column names (`id`, `id_1`, ...) so every value in a row
/// gets its own key. Joins often return the same name twice.
fn unique_names(columns: Vec<String>) -> Vec<String> {
    let mut taken: HashSet<String> = columns.iter().cloned().collect();
    let mut seen: HashSet<String> = HashSet::with_capacity(columns.len());
    columns
        .into_iter()
        .map(|name| {
            if seen.insert(name.clone()) {
                return name;
            }
            let mut n = 1;
            loop {
                let candidate = format!("{name}_{n}");
                if taken.insert(candidate.clone()) {
                    seen.insert(candidate.clone());
                    return candidate;
                }
                n += 1;
            }
        })
        .collect()
}

/// `{ success, statementId, data: [{column: value}], columns: [{name, id}], rowCount }`.
fn shape_result(result: StatementResult) -> Value {
    let width = result.rows.iter().map(Vec::len).max().unwrap_or(0);
    let names: Vec<String> = if result.columns.len() >= width {
        unique_names(result.columns)
    } else {
        (0..width).map(|i| i.to_string()).collect()
    };

    let data: Vec<Value> = result
        .rows
        .iter()
        .map(|row| {
            let record: Map<String, Value> = names
                .iter()
                .zip(row.iter())
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            Value::Object(record)
        })
        .collect();

    let columns: Vec<Value> = names.iter().map(|n| json!({ "name": n, "id": n })).collect();

    json!({
        "success": true,
        "statementId": result.statement_id,
        "data": data,
        "columns": columns,
        "rowCount": result.rows.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_values_become_strings() {
        let params: Map<String, Value> = serde_json::from_value(json!({
            "name": "ada",
            "limit": 10,
            "flag": true,
            "missing": null
        }))
        .unwrap();

        let mut out = statement_parameters(params);
        out.sort_by(|a, b| a.name.cmp(&b.name));
        let values: Vec<_> = out.iter().map(|p| (p.name.as_str(), p.value.as_deref())).collect();
        assert_eq!(
            values,
            vec![
                ("flag", Some("true")),
                ("limit", Some("10")),
                ("missing", None),
                ("name", Some("ada")),
            ]
        );
    }

    #[test]
    fn parameterisation_markers() {
        assert!(looks_parameterised("SELECT * FROM t WHERE id = :id"));
        assert!(looks_parameterised("SELECT * FROM ${table}"));
        assert!(looks_parameterised("SELECT {{col}} FROM t"));
        assert!(!looks_parameterised("SELECT 1"));
    }

    #[test]
    fn rows_are_keyed_by_manifest_columns() {
        let shaped = shape_result(StatementResult {
            statement_id: "st".into(),
            state: "SUCCEEDED".into(),
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![json!("1"), json!("a")]],
        });
        assert_eq!(shaped["data"][0], json!({"id": "1", "name": "a"}));
        assert_eq!(shaped["columns"][1], json!({"name": "name", "id": "name"}));
        assert_eq!(shaped["rowCount"], 1);
    }

    #[test]
    fn repeated_column_names_keep_every_value() {
        let shaped = shape_result(StatementResult {
            statement_id: "st".into(),
            state: "SUCCEEDED".into(),
            columns: vec!["id".into(), "id".into(), "name".into()],
            rows: vec![vec![json!("1"), json!("2"), json!("a")]],
        });
        assert_eq!(shaped["data"][0], json!({"id": "1", "id_1": "2", "name": "a"}));
        let ids: Vec<_> = shaped["columns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["id", "id_1", "name"]);
    }

    #[test]
    fn suffixes_skip_names_already_in_the_manifest() {
        let names = unique_names(vec!["id".into(), "id_1".into(), "id".into(), "id".into()]);
        assert_eq!(names, vec!["id", "id_1", "id_2", "id_3"]);
    }

    #[test]
    fn missing_manifest_falls_back_to_indices() {
        let shaped = shape_result(StatementResult {
            statement_id: "st".into(),
            state: "SUCCEEDED".into(),
            columns: vec![],
            rows: vec![vec![json!("x"), json!("y")]],
        });
        assert_eq!(shaped["data"][0], json!({"0": "x", "1": "y"}));
        assert_eq!(shaped["columns"][0]["id"], "0");
    }

    #[test]
    fn empty_result_has_no_rows() {
        let shaped = shape_result(StatementResult {
            statement_id: "st".into(),
            state: "SUCCEEDED".into(),
            columns: vec!["id".into()],
            rows: vec![],
        });
        assert_eq!(shaped["data"], json!([]));
        assert_eq!(shaped["rowCount"], 0);
        assert_eq!(shaped["columns"], json!([{"name": "id", "id": "id"}]));
    }
}
