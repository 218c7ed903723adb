//! Results and diagnostic traces

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::backend::BackendError;
use crate::error::{ErrorType, OperationError};

/// One attempt of one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub method: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AttemptRecord {
    pub fn success(method: impl Into<String>, attempt: u32) -> Self {
        Self {
            method: method.into(),
            attempt,
            timestamp: Utc::now(),
            success: true,
            error_type: None,
            status: None,
            message: None,
        }
    }

    pub fn failure(method: impl Into<String>, attempt: u32, err: &BackendError) -> Self {
        let status = err.status();
        Self {
            method: method.into(),
            attempt,
            timestamp: Utc::now(),
            success: false,
            error_type: Some(err.error_type()),
            status: (status != 0).then_some(status),
            message: Some(err.message().to_string()),
        }
    }
}

/// Chronological record of everything one operation tried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugTrace {
    pub operation_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Distinct methods in the order first tried
    pub methods: Vec<String>,
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_method: Option<String>,
    /// Non-fatal annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl DebugTrace {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            methods: Vec::new(),
            attempts: Vec::new(),
            final_method: None,
            notes: Vec::new(),
        }
    }

    /// Append an attempt, registering its method
    pub fn push_attempt(&mut self, record: AttemptRecord) {
        self.record_method(&record.method);
        self.attempts.push(record);
    }

    /// Register a method without an attempt
    pub fn record_method(&mut self, method: &str) {
        if !self.methods.iter().any(|m| m == method) {
            self.methods.push(method.to_string());
        }
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Stamp the end of the operation
    pub fn finish(&mut self, final_method: impl Into<String>) {
        self.finished_at = Some(Utc::now());
        self.final_method = Some(final_method.into());
    }
}

/// Outcome of an SQL-executing operation
///
/// Exactly one of data or error is present. Serializes as
/// `{success, data | error, debug_info}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    outcome: Result<Value, OperationError>,
    pub debug_info: DebugTrace,
}

impl ExecutionResult {
    pub fn ok(data: Value, debug_info: DebugTrace) -> Self {
        Self {
            outcome: Ok(data),
            debug_info,
        }
    }

    pub fn err(error: OperationError, debug_info: DebugTrace) -> Self {
        Self {
            outcome: Err(error),
            debug_info,
        }
    }

    pub fn from_outcome(outcome: Result<Value, OperationError>, debug_info: DebugTrace) -> Self {
        Self {
            outcome,
            debug_info,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn data(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&OperationError> {
        self.outcome.as_ref().err()
    }

    pub fn outcome(&self) -> &Result<Value, OperationError> {
        &self.outcome
    }

    pub fn into_result(self) -> Result<Value, OperationError> {
        self.outcome
    }
}

impl Serialize for ExecutionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ExecutionResult", 3)?;
        state.serialize_field("success", &self.is_success())?;
        match &self.outcome {
            Ok(data) => state.serialize_field("data", data)?,
            Err(error) => state.serialize_field("error", error)?,
        }
        state.serialize_field("debug_info", &self.debug_info)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_methods_are_deduplicated_in_order() {
        let mut trace = DebugTrace::new("op_1");
        trace.push_attempt(AttemptRecord::success("edge-function", 0));
        trace.push_attempt(AttemptRecord::success("direct-rpc", 0));
        trace.push_attempt(AttemptRecord::success("edge-function", 1));
        assert_eq!(trace.methods, vec!["edge-function", "direct-rpc"]);
        assert_eq!(trace.attempts.len(), 3);
    }

    #[test]
    fn test_failure_record_drops_zero_status() {
        let record = AttemptRecord::failure(
            "edge-function",
            1,
            &BackendError::Network {
                status: 0,
                message: "connection reset".into(),
            },
        );
        assert!(!record.success);
        assert_eq!(record.status, None);
        assert_eq!(record.error_type, Some(ErrorType::Network));
    }

    #[test]
    fn test_result_serializes_as_tagged_shape() {
        let ok = ExecutionResult::ok(json!({"rows": 1}), DebugTrace::new("a"));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["rows"], 1);
        assert!(value.get("error").is_none());

        let err = ExecutionResult::err(
            OperationError::new(ErrorCode::EmptySql, "SQL query cannot be empty"),
            DebugTrace::new("b"),
        );
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "EMPTY_SQL");
        assert!(value.get("data").is_none());
        assert_eq!(value["debug_info"]["operation_id"], "b");
    }

    #[test]
    fn test_finish_sets_final_method() {
        let mut trace = DebugTrace::new("op");
        trace.finish("auth_error");
        assert_eq!(trace.final_method.as_deref(), Some("auth_error"));
        assert!(trace.finished_at.is_some());
    }
}
