//! Audit log of every SQL execution
//!
//! Writes are best-effort: [`MigrationLogRecorder::safely_log_operation`]
//! awaits the insert so rows land in order, but a failed write only emits a
//! warning and never changes the outcome of the operation being logged.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlbridge_client::SelectQuery;

use crate::backend::{Backend, BackendError};
use crate::error::{ErrorCode, OperationError};
use crate::trace::{DebugTrace, ExecutionResult};

/// Well-known `operation_type` values
pub mod operation_type {
    pub const CUSTOM_SQL: &str = "custom_sql";
    pub const SETUP_EXEC_SQL: &str = "setup_exec_sql";
    pub const VERIFY_EXEC_SQL: &str = "verify_exec_sql";
    pub const APPLY_MIGRATION: &str = "apply_migration";
    pub const CREATE_LOGS_TABLE: &str = "create_logs_table";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Failed,
    Error,
}

/// One row of the audit table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationLogEntry {
    /// Server-assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub operation_id: String,
    pub operation_type: String,
    #[serde(default)]
    pub sql_content: Option<String>,
    pub status: LogStatus,
    #[serde(default)]
    pub method_used: Option<String>,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub details: Value,
    /// Server-assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// What the caller knows about an operation before its outcome
#[derive(Debug, Clone)]
pub struct OperationData {
    pub operation_id: String,
    pub operation_type: String,
    pub sql_content: Option<String>,
    pub method_used: String,
    pub details: Value,
}

impl OperationData {
    pub fn new(
        operation_id: impl Into<String>,
        operation_type: impl Into<String>,
        method_used: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            operation_type: operation_type.into(),
            sql_content: None,
            method_used: method_used.into(),
            details: Value::Null,
        }
    }

    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.sql_content = Some(sql.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// The outcome half of a log entry
#[derive(Debug, Clone, Copy)]
pub struct OperationOutcome<'a> {
    pub success: bool,
    pub error: Option<&'a OperationError>,
    pub debug_info: Option<&'a DebugTrace>,
}

impl<'a> OperationOutcome<'a> {
    pub fn succeeded(debug_info: Option<&'a DebugTrace>) -> Self {
        Self {
            success: true,
            error: None,
            debug_info,
        }
    }

    pub fn failed(error: &'a OperationError, debug_info: Option<&'a DebugTrace>) -> Self {
        Self {
            success: false,
            error: Some(error),
            debug_info,
        }
    }
}

impl<'a> From<&'a ExecutionResult> for OperationOutcome<'a> {
    fn from(result: &'a ExecutionResult) -> Self {
        Self {
            success: result.is_success(),
            error: result.error(),
            debug_info: Some(&result.debug_info),
        }
    }
}

impl OperationData {
    fn into_entry(self, started: Instant, outcome: OperationOutcome<'_>) -> MigrationLogEntry {
        let status = match outcome.error {
            _ if outcome.success => LogStatus::Success,
            Some(err) if err.code == ErrorCode::UnexpectedError => LogStatus::Error,
            _ => LogStatus::Failed,
        };

        let mut details = match self.details {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("context".to_string(), other);
                map
            }
        };
        if let Some(err) = outcome.error {
            details.insert(
                "error".to_string(),
                serde_json::to_value(err).unwrap_or(Value::Null),
            );
        }
        if let Some(trace) = outcome.debug_info {
            details.insert(
                "debug_info".to_string(),
                serde_json::to_value(trace).unwrap_or(Value::Null),
            );
        }

        MigrationLogEntry {
            id: None,
            operation_id: self.operation_id,
            operation_type: self.operation_type,
            sql_content: self.sql_content,
            status,
            method_used: Some(self.method_used),
            execution_time_ms: started.elapsed().as_millis() as u64,
            details: Value::Object(details),
            created_at: None,
        }
    }
}

/// Result of reading the audit log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogsResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<MigrationLogEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

/// Reads and writes the audit table
pub struct MigrationLogRecorder {
    backend: Arc<dyn Backend>,
    table: String,
}

impl MigrationLogRecorder {
    pub fn new(backend: Arc<dyn Backend>, table: impl Into<String>) -> Self {
        Self {
            backend,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Insert one entry
    pub async fn log_migration_operation(
        &self,
        entry: &MigrationLogEntry,
    ) -> Result<(), BackendError> {
        let row = serde_json::to_value(entry).map_err(|e| BackendError::Parse(e.to_string()))?;
        self.backend.insert(&self.table, row).await?;
        Ok(())
    }

    /// Build an entry from `operation` and `outcome` and insert it, swallowing failures
    pub async fn safely_log_operation(
        &self,
        operation: OperationData,
        started: Instant,
        outcome: OperationOutcome<'_>,
    ) {
        let entry = operation.into_entry(started, outcome);
        if let Err(e) = self.log_migration_operation(&entry).await {
            tracing::warn!(
                operation_id = %entry.operation_id,
                operation_type = %entry.operation_type,
                error = %e,
                "failed to write migration log"
            );
        }
    }

    /// `Ok(false)` when the table is missing, `Err` when we could not tell
    pub async fn table_exists(&self) -> Result<bool, BackendError> {
        match self
            .backend
            .select(&self.table, SelectQuery::new("id").limit(1))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_missing_relation() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Entries matching `query`
    pub async fn find(&self, query: SelectQuery) -> Result<Vec<MigrationLogEntry>, BackendError> {
        let rows = self.backend.select(&self.table, query).await?;
        let rows = match rows {
            Value::Null => return Ok(Vec::new()),
            rows => rows,
        };
        serde_json::from_value(rows).map_err(|e| BackendError::Parse(e.to_string()))
    }

    /// Every entry, newest first
    pub async fn get_migration_logs(&self) -> LogsResult {
        match self.table_exists().await {
            Ok(true) => {}
            Ok(false) => {
                return LogsResult::failed(OperationError::new(
                    ErrorCode::TableMissing,
                    "Migration logs table does not exist",
                ))
            }
            Err(e) => return LogsResult::failed(OperationError::from(&e)),
        }

        match self
            .find(SelectQuery::default().order_desc("created_at"))
            .await
        {
            Ok(entries) => LogsResult {
                success: true,
                data: Some(entries),
                error: None,
            },
            Err(e) => LogsResult::failed(OperationError::from(&e)),
        }
    }
}

impl LogsResult {
    fn failed(error: OperationError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Details attached to entries written by the bootstrapper
pub(crate) fn strategy_details(strategy: &str, attempt: Option<u32>, extra: Value) -> Value {
    let mut details = json!({ "strategy": strategy });
    if let Some(attempt) = attempt {
        details["attempt"] = json!(attempt);
    }
    if let (Value::Object(map), Value::Object(extra)) = (&mut details, extra) {
        map.extend(extra);
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_status_from_outcome() {
        let started = Instant::now();
        let entry = OperationData::new("op", operation_type::CUSTOM_SQL, "edge-function")
            .sql("SELECT 1")
            .into_entry(started, OperationOutcome::succeeded(None));
        assert_eq!(entry.status, LogStatus::Success);
        assert_eq!(entry.sql_content.as_deref(), Some("SELECT 1"));
        assert_eq!(entry.method_used.as_deref(), Some("edge-function"));

        let err = OperationError::new(ErrorCode::SqlError, "syntax error");
        let entry = OperationData::new("op", operation_type::CUSTOM_SQL, "direct-rpc")
            .into_entry(started, OperationOutcome::failed(&err, None));
        assert_eq!(entry.status, LogStatus::Failed);
        assert_eq!(entry.details["error"]["code"], "SQL_ERROR");

        let err = OperationError::new(ErrorCode::UnexpectedError, "panicked");
        let entry = OperationData::new("op", operation_type::CUSTOM_SQL, "unexpected")
            .into_entry(started, OperationOutcome::failed(&err, None));
        assert_eq!(entry.status, LogStatus::Error);
    }

    #[test]
    fn test_entry_merges_details_and_trace() {
        let trace = DebugTrace::new("op_7");
        let entry = OperationData::new("op_7", operation_type::APPLY_MIGRATION, "edge-function")
            .details(json!({ "migration": "create_migration_logs" }))
            .into_entry(Instant::now(), OperationOutcome::succeeded(Some(&trace)));
        assert_eq!(entry.details["migration"], "create_migration_logs");
        assert_eq!(entry.details["debug_info"]["operation_id"], "op_7");
    }

    #[test]
    fn test_non_object_details_are_wrapped() {
        let entry = OperationData::new("op", operation_type::CUSTOM_SQL, "edge-function")
            .details(json!("plain"))
            .into_entry(Instant::now(), OperationOutcome::succeeded(None));
        assert_eq!(entry.details["context"], "plain");
    }

    #[test]
    fn test_entry_deserializes_server_row() {
        let row = json!({
            "id": 12,
            "operation_id": "sql_abc",
            "operation_type": "custom_sql",
            "sql_content": "SELECT 1",
            "status": "success",
            "method_used": "edge-function",
            "execution_time_ms": 42,
            "details": {},
            "created_at": "2024-05-01T10:00:00.123456+00:00"
        });
        let entry: MigrationLogEntry = serde_json::from_value(row).unwrap();
        assert_eq!(entry.id, Some(12));
        assert_eq!(entry.status, LogStatus::Success);
        assert!(entry.created_at.is_some());
    }

    #[test]
    fn test_insert_row_omits_server_fields() {
        let entry = OperationData::new("op", operation_type::CUSTOM_SQL, "edge-function")
            .into_entry(Instant::now(), OperationOutcome::succeeded(None));
        let row = serde_json::to_value(&entry).unwrap();
        assert!(row.get("id").is_none());
        assert!(row.get("created_at").is_none());
        assert_eq!(row["status"], "success");
    }

    #[test]
    fn test_strategy_details() {
        let details = strategy_details("edge-function", Some(1), json!({ "verified": false }));
        assert_eq!(details["strategy"], "edge-function");
        assert_eq!(details["attempt"], 1);
        assert_eq!(details["verified"], false);
    }
}
