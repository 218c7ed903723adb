//! Test utilities for sqlbridge-core.
//!
//! [`MockBackend`] simulates a hosted Postgres project in memory: installed
//! procedures, tables with rows, and the side effects of the DDL this crate
//! sends. Individual calls can be overridden with scripted responses, and
//! every call is recorded for assertions.
//!
//! Enable with the `test-utils` feature:
//!
//! ```toml
//! [dev-dependencies]
//! sqlbridge-core = { version = "...", features = ["test-utils"] }
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sqlbridge_core::MigrationSystem;
//! use sqlbridge_core::test_utils::MockBackend;
//!
//! # tokio_test::block_on(async {
//! let backend = MockBackend::new();
//! let system = MigrationSystem::builder()
//!     .backend(Arc::new(backend.clone()))
//!     .build()
//!     .unwrap();
//!
//! let result = system.run_custom_sql("SELECT 1", None).await;
//! assert!(result.is_success());
//! assert_eq!(backend.rows("migration_logs").len(), 1);
//! # });
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sqlbridge_client::SelectQuery;

use crate::backend::{Backend, BackendError};

/// Which backend method a call went to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    CurrentUser,
    RestRoot,
    Health,
    Preflight,
    InvokeFunction,
    Rpc,
    Select,
    Insert,
    RunQuery,
}

/// A recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub endpoint: Endpoint,
    /// Function, procedure or table name; empty when not applicable
    pub target: String,
    /// Request body, args, row or SQL
    pub payload: Value,
}

impl Call {
    /// SQL carried by the call, if any
    pub fn sql(&self) -> Option<&str> {
        match &self.payload {
            Value::String(sql) => Some(sql),
            Value::Object(map) => map
                .get("sql_text")
                .or_else(|| map.get("sql"))
                .and_then(Value::as_str),
            _ => None,
        }
    }
}

#[derive(Default)]
struct State {
    scripted: HashMap<(Endpoint, String), VecDeque<Result<Value, BackendError>>>,
    failing: HashMap<Endpoint, BackendError>,
    calls: Vec<Call>,
    tables: HashMap<String, Vec<Value>>,
    functions: HashSet<String>,
    next_id: i64,
}

/// An in-memory backend for tests
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<Mutex<State>>,
}

impl MockBackend {
    /// A healthy project: `exec_sql` installed, `migration_logs` present
    pub fn new() -> Self {
        let backend = Self {
            state: Arc::new(Mutex::new(State::default())),
        };
        backend.state.lock().functions.insert("exec_sql".to_string());
        backend
            .state
            .lock()
            .tables
            .insert("migration_logs".to_string(), Vec::new());
        backend
    }

    /// Remove the exec procedure
    pub fn without_exec_sql(self) -> Self {
        self.state.lock().functions.remove("exec_sql");
        self
    }

    pub fn without_table(self, table: &str) -> Self {
        self.state.lock().tables.remove(table);
        self
    }

    pub fn with_table(self, table: &str) -> Self {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default();
        self
    }

    pub fn with_function(self, function: &str) -> Self {
        self.state.lock().functions.insert(function.to_string());
        self
    }

    /// Queue a one-shot response for every call to `endpoint`
    pub fn script(self, endpoint: Endpoint, response: Result<Value, BackendError>) -> Self {
        self.script_target(endpoint, "", response)
    }

    /// Queue a one-shot response for calls to `endpoint` naming `target`
    pub fn script_target(
        self,
        endpoint: Endpoint,
        target: &str,
        response: Result<Value, BackendError>,
    ) -> Self {
        self.state
            .lock()
            .scripted
            .entry((endpoint, target.to_string()))
            .or_default()
            .push_back(response);
        self
    }

    /// Fail every call to `endpoint` until [`Self::recover`]
    pub fn fail(self, endpoint: Endpoint, error: BackendError) -> Self {
        self.state.lock().failing.insert(endpoint, error);
        self
    }

    /// Fail every endpoint with `error`
    pub fn fail_everything(self, error: BackendError) -> Self {
        {
            let mut state = self.state.lock();
            for endpoint in [
                Endpoint::CurrentUser,
                Endpoint::RestRoot,
                Endpoint::Health,
                Endpoint::Preflight,
                Endpoint::InvokeFunction,
                Endpoint::Rpc,
                Endpoint::Select,
                Endpoint::Insert,
                Endpoint::RunQuery,
            ] {
                state.failing.insert(endpoint, error.clone());
            }
        }
        self
    }

    pub fn recover(&self, endpoint: Endpoint) {
        self.state.lock().failing.remove(&endpoint);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, endpoint: Endpoint) -> Vec<Call> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Rows of `table`, in insertion order
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state.lock().tables.contains_key(table)
    }

    pub fn has_function(&self, function: &str) -> bool {
        self.state.lock().functions.contains(function)
    }

    fn begin(&self, endpoint: Endpoint, target: &str, payload: Value) -> Option<Result<Value, BackendError>> {
        let mut state = self.state.lock();
        state.calls.push(Call {
            endpoint,
            target: target.to_string(),
            payload,
        });

        for key in [(endpoint, target.to_string()), (endpoint, String::new())] {
            if let Some(response) = state.scripted.get_mut(&key).and_then(VecDeque::pop_front) {
                return Some(response);
            }
        }
        state.failing.get(&endpoint).cloned().map(Err)
    }

    /// Apply the DDL effects this crate relies on
    fn apply_sql(&self, sql: &str) {
        let mut state = self.state.lock();
        for name in names_after(sql, "CREATE OR REPLACE FUNCTION public.") {
            state.functions.insert(name);
        }
        for name in names_after(sql, "CREATE TABLE IF NOT EXISTS public.") {
            state.tables.entry(name).or_default();
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn names_after(sql: &str, prefix: &str) -> Vec<String> {
    sql.match_indices(prefix)
        .map(|(index, _)| {
            sql[index + prefix.len()..]
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect()
        })
        .collect()
}

fn sql_of(payload: &Value) -> String {
    payload
        .get("sql_text")
        .or_else(|| payload.get("sql"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// 401 as the backend sends it
pub fn unauthorized() -> BackendError {
    BackendError::Unauthorized {
        status: 401,
        message: "Invalid JWT".to_string(),
    }
}

/// Connection refused
pub fn network_down() -> BackendError {
    BackendError::Network {
        status: 0,
        message: "error sending request: connection refused".to_string(),
    }
}

/// PostgREST's answer for an unknown procedure
pub fn missing_function(function: &str) -> BackendError {
    BackendError::Api {
        status: 404,
        message: format!(
            "Could not find the function public.{}(sql_text) in the schema cache",
            function
        ),
        code: Some("PGRST202".to_string()),
        details: None,
    }
}

/// Postgres' answer for an unknown table
pub fn missing_relation(table: &str) -> BackendError {
    BackendError::Api {
        status: 404,
        message: format!("relation \"public.{}\" does not exist", table),
        code: Some("42P01".to_string()),
        details: None,
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn current_user(&self) -> Result<Value, BackendError> {
        if let Some(response) = self.begin(Endpoint::CurrentUser, "", Value::Null) {
            return response;
        }
        Ok(json!({ "id": "00000000-0000-0000-0000-000000000001", "role": "authenticated" }))
    }

    async fn rest_root(&self) -> Result<Value, BackendError> {
        if let Some(response) = self.begin(Endpoint::RestRoot, "", Value::Null) {
            return response;
        }
        Ok(json!({ "swagger": "2.0" }))
    }

    async fn health(&self) -> Result<Value, BackendError> {
        if let Some(response) = self.begin(Endpoint::Health, "", Value::Null) {
            return response;
        }
        Ok(json!({ "name": "GoTrue" }))
    }

    async fn preflight_function(&self, name: &str) -> Result<(), BackendError> {
        match self.begin(Endpoint::Preflight, name, Value::Null) {
            Some(response) => response.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn invoke_function(&self, name: &str, body: Value) -> Result<Value, BackendError> {
        if let Some(response) = self.begin(Endpoint::InvokeFunction, name, body.clone()) {
            return response;
        }

        let sql = sql_of(&body);
        let creates_exec_sql = names_after(&sql, "CREATE OR REPLACE FUNCTION public.")
            .iter()
            .any(|n| n == "exec_sql");
        if !creates_exec_sql && !self.has_function("exec_sql") {
            return Ok(json!({
                "error": {
                    "message": "function exec_sql(text) does not exist",
                    "code": "42883"
                }
            }));
        }

        self.apply_sql(&sql);
        Ok(json!({ "data": { "success": true }, "error": null }))
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, BackendError> {
        if let Some(response) = self.begin(Endpoint::Rpc, function, args.clone()) {
            return response;
        }
        if !self.has_function(function) {
            return Err(missing_function(function));
        }
        if function == "exec_sql" {
            self.apply_sql(&sql_of(&args));
            return Ok(json!({ "success": true }));
        }
        Ok(json!({}))
    }

    async fn select(&self, table: &str, query: SelectQuery) -> Result<Value, BackendError> {
        if let Some(response) = self.begin(Endpoint::Select, table, json!(query.to_pairs())) {
            return response;
        }

        let state = self.state.lock();
        let Some(rows) = state.tables.get(table) else {
            return Err(missing_relation(table));
        };

        let mut rows: Vec<Value> = rows.clone();
        let mut limit = None;
        for (key, value) in query.to_pairs() {
            match key.as_str() {
                "select" => {}
                "limit" => limit = value.parse::<usize>().ok(),
                "order" => {
                    let (column, direction) = value.split_once('.').unwrap_or((value.as_str(), "asc"));
                    rows.sort_by(|a, b| {
                        let a = a[column].as_str().unwrap_or_default();
                        let b = b[column].as_str().unwrap_or_default();
                        a.cmp(b)
                    });
                    if direction == "desc" {
                        rows.reverse();
                    }
                }
                column => {
                    let expected = value.strip_prefix("eq.").unwrap_or(value.as_str());
                    rows.retain(|row| match &row[column] {
                        Value::String(s) => s == expected,
                        other => other.to_string() == expected,
                    });
                }
            }
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(Value::Array(rows))
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError> {
        if let Some(response) = self.begin(Endpoint::Insert, table, row.clone()) {
            return response;
        }

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let Some(rows) = state.tables.get_mut(table) else {
            return Err(missing_relation(table));
        };

        let mut row = row;
        if let Value::Object(map) = &mut row {
            map.insert("id".to_string(), json!(id));
            // Monotonic timestamps keep ordering deterministic
            let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now)
                + Duration::seconds(id);
            map.insert("created_at".to_string(), json!(created_at.to_rfc3339()));
        }
        rows.push(row);
        Ok(Value::Null)
    }

    async fn run_query(&self, sql: &str) -> Result<Value, BackendError> {
        if let Some(response) = self.begin(Endpoint::RunQuery, "", json!(sql)) {
            return response;
        }
        self.apply_sql(sql);
        Ok(json!([]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_after() {
        let names = names_after(
            "CREATE OR REPLACE FUNCTION public.exec_sql(sql_text text) ...",
            "CREATE OR REPLACE FUNCTION public.",
        );
        assert_eq!(names, vec!["exec_sql"]);
    }

    #[tokio::test]
    async fn test_scripted_response_takes_precedence_once() {
        let backend = MockBackend::new().script(Endpoint::Health, Err(network_down()));
        assert!(backend.health().await.is_err());
        assert!(backend.health().await.is_ok());
        assert_eq!(backend.calls_to(Endpoint::Health).len(), 2);
    }

    #[tokio::test]
    async fn test_targeted_script() {
        let backend = MockBackend::new().script_target(
            Endpoint::Rpc,
            "get_migration_system_status",
            Ok(json!({ "exec_sql_function": true })),
        );
        assert!(backend.rpc("get_migration_system_status", json!({})).await.is_ok());
        assert!(backend.rpc("get_migration_system_status", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_insert_and_select_ordering() {
        let backend = MockBackend::new();
        backend
            .insert("migration_logs", json!({ "operation_id": "a", "status": "success" }))
            .await
            .unwrap();
        backend
            .insert("migration_logs", json!({ "operation_id": "b", "status": "failed" }))
            .await
            .unwrap();

        let rows = backend
            .select("migration_logs", SelectQuery::default().order_desc("created_at"))
            .await
            .unwrap();
        assert_eq!(rows[0]["operation_id"], "b");

        let rows = backend
            .select("migration_logs", SelectQuery::default().eq("status", "success"))
            .await
            .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exec_sql_creates_tables() {
        let backend = MockBackend::new().without_table("migration_logs");
        backend
            .rpc(
                "exec_sql",
                json!({ "sql_text": "CREATE TABLE IF NOT EXISTS public.migration_logs (id serial)" }),
            )
            .await
            .unwrap();
        assert!(backend.has_table("migration_logs"));
    }

    #[tokio::test]
    async fn test_edge_function_without_exec_sql() {
        let backend = MockBackend::new().without_exec_sql();
        let body = backend
            .invoke_function("execute-sql", json!({ "sql": "SELECT 1" }))
            .await
            .unwrap();
        assert_eq!(body["error"]["code"], "42883");

        backend
            .invoke_function(
                "execute-sql",
                json!({ "sql": "CREATE OR REPLACE FUNCTION public.exec_sql(sql_text text)" }),
            )
            .await
            .unwrap();
        assert!(backend.has_function("exec_sql"));
    }
}
