//! Method name constants, grouped by service namespace.
//!
//! Each constant is the exact string sent as the `method` field of a
//! JSON-RPC request.

/// All gateway method names.
pub struct Methods;

impl Methods {
    // ── SQL warehouse ───────────────────────────────────────────────────
    pub const SQL_EXECUTE: &str = "sql/execute";

    // ── Jobs ────────────────────────────────────────────────────────────
    pub const JOB_SUBMIT: &str = "job/submit";

    // ── Model serving ───────────────────────────────────────────────────
    pub const SERVING_QUERY: &str = "serving/query";

    // ── Logging ─────────────────────────────────────────────────────────
    pub const LOG_TEST: &str = "log/test";

    // ── App ─────────────────────────────────────────────────────────────
    pub const APP_STATUS: &str = "app/status";
}

/// The namespace prefix of a method (`"sql/execute"` → `"sql"`).
pub fn namespace_of(method: &str) -> &str {
    method.split('/').next().unwrap_or("")
}
