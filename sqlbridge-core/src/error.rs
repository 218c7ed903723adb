//! Error taxonomy for sqlbridge
//!
//! Operational failures never surface as `Err` from the public API. They are
//! reported inside result objects as an [`OperationError`] whose [`ErrorCode`]
//! tells the caller how to react. [`Error`] is reserved for construction-time
//! problems (missing backend, bad configuration).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::backend::BackendError;

/// Machine-readable failure code carried by every [`OperationError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// SQL was empty or whitespace-only; nothing was sent
    EmptySql,
    /// 401/403 at any layer; terminal
    AuthError,
    /// Transport failure, status 0 or 5xx
    NetworkError,
    /// CORS preflight failure
    CorsError,
    /// Malformed response body
    ParseError,
    /// Edge function invocation failed for another reason
    EdgeFunctionError,
    /// SQL or application error reported by the backend
    SqlError,
    /// Every connection probe failed with mixed causes
    ConnectionError,
    /// Migration name not in the catalog
    UnknownMigration,
    /// A required table does not exist
    TableMissing,
    /// Bootstrapping the server-side prerequisites failed
    SetupFailed,
    /// Top-level catch-all
    UnexpectedError,
}

impl ErrorCode {
    /// The wire string, e.g. `AUTH_ERROR`
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::EmptySql => "EMPTY_SQL",
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::CorsError => "CORS_ERROR",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::EdgeFunctionError => "EDGE_FUNCTION_ERROR",
            ErrorCode::SqlError => "SQL_ERROR",
            ErrorCode::ConnectionError => "CONNECTION_ERROR",
            ErrorCode::UnknownMigration => "UNKNOWN_MIGRATION",
            ErrorCode::TableMissing => "TABLE_MISSING",
            ErrorCode::SetupFailed => "SETUP_FAILED",
            ErrorCode::UnexpectedError => "UNEXPECTED_ERROR",
        }
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::CorsError
                | ErrorCode::ParseError
                | ErrorCode::EdgeFunctionError
                | ErrorCode::SqlError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a single probe or attempt failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Auth,
    Network,
    Cors,
    Api,
    General,
}

impl ErrorType {
    /// The code a failure of this type reports
    pub fn code(&self) -> ErrorCode {
        match self {
            ErrorType::Auth => ErrorCode::AuthError,
            ErrorType::Network => ErrorCode::NetworkError,
            ErrorType::Cors => ErrorCode::CorsError,
            ErrorType::Api => ErrorCode::SqlError,
            ErrorType::General => ErrorCode::ParseError,
        }
    }
}

/// Structured failure returned inside result objects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    pub message: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl OperationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            status: None,
            details: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_auth(&self) -> bool {
        self.code == ErrorCode::AuthError
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<&BackendError> for OperationError {
    fn from(err: &BackendError) -> Self {
        let code = match err {
            BackendError::Unauthorized { .. } => ErrorCode::AuthError,
            BackendError::Network { .. } => ErrorCode::NetworkError,
            BackendError::Cors(_) => ErrorCode::CorsError,
            BackendError::Parse(_) => ErrorCode::ParseError,
            BackendError::Api { .. } => ErrorCode::SqlError,
        };
        let mut op = OperationError::new(code, err.message());
        if err.status() != 0 {
            op.status = Some(err.status());
        }
        if let BackendError::Api {
            code: Some(sql_code),
            details,
            ..
        } = err
        {
            op.details = Some(serde_json::json!({
                "sql_state": sql_code,
                "details": details,
            }));
        }
        op
    }
}

/// Construction and configuration errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing backend, invalid settings)
    #[error("configuration error: {0}")]
    Config(String),

    /// The backend could not be created
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for sqlbridge construction
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_strings() {
        assert_eq!(
            serde_json::to_value(ErrorCode::EmptySql).unwrap(),
            serde_json::json!("EMPTY_SQL")
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::EdgeFunctionError).unwrap(),
            serde_json::json!("EDGE_FUNCTION_ERROR")
        );
        assert_eq!(ErrorCode::UnexpectedError.to_string(), "UNEXPECTED_ERROR");
    }

    #[test]
    fn test_wire_strings_match_serde() {
        for code in [
            ErrorCode::AuthError,
            ErrorCode::NetworkError,
            ErrorCode::CorsError,
            ErrorCode::ParseError,
            ErrorCode::SqlError,
            ErrorCode::ConnectionError,
            ErrorCode::UnknownMigration,
            ErrorCode::TableMissing,
            ErrorCode::SetupFailed,
        ] {
            assert_eq!(
                serde_json::to_value(code).unwrap(),
                serde_json::json!(code.as_str())
            );
        }
    }

    #[test]
    fn test_auth_is_not_retryable() {
        assert!(!ErrorCode::AuthError.is_retryable());
        assert!(!ErrorCode::EmptySql.is_retryable());
        assert!(!ErrorCode::UnexpectedError.is_retryable());
        assert!(ErrorCode::NetworkError.is_retryable());
        assert!(ErrorCode::ParseError.is_retryable());
    }

    #[test]
    fn test_from_backend_error() {
        let err = BackendError::Unauthorized {
            status: 403,
            message: "forbidden".into(),
        };
        let op = OperationError::from(&err);
        assert!(op.is_auth());
        assert_eq!(op.status, Some(403));

        let op = OperationError::from(&BackendError::Network {
            status: 0,
            message: "refused".into(),
        });
        assert_eq!(op.code, ErrorCode::NetworkError);
        assert_eq!(op.status, None);

        let op = OperationError::from(&BackendError::Api {
            status: 400,
            message: "syntax error".into(),
            code: Some("42601".into()),
            details: None,
        });
        assert_eq!(op.code, ErrorCode::SqlError);
        assert_eq!(op.details.unwrap()["sql_state"], "42601");
    }

    #[test]
    fn test_operation_error_serializes_compactly() {
        let op = OperationError::new(ErrorCode::EmptySql, "SQL query cannot be empty");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["code"], "EMPTY_SQL");
        assert!(json.get("status").is_none());
        assert!(json.get("details").is_none());
    }
}
