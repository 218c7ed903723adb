//! The backend seam
//!
//! Every component reaches the hosted Postgres project through [`Backend`].
//! Production code uses [`RestBackend`]; tests use the scripted
//! `MockBackend` from `test_utils`.

mod rest;

pub use rest::RestBackend;

use async_trait::async_trait;
use serde_json::Value;
use sqlbridge_client::SelectQuery;
use thiserror::Error;

use crate::error::ErrorType;

/// Failure of a single backend call, already classified
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// 401 or 403
    #[error("unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// No response (status 0), or a 5xx/520 from the gateway
    #[error("network error ({status}): {message}")]
    Network { status: u16, message: String },

    /// CORS preflight rejected or failed
    #[error("CORS error: {0}")]
    Cors(String),

    /// Response body could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Non-2xx API response or an application-level error body
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        code: Option<String>,
        details: Option<String>,
    },
}

impl BackendError {
    /// An application-level error reported inside a 2xx body
    pub fn application(message: impl Into<String>, code: Option<String>) -> Self {
        BackendError::Api {
            status: 200,
            message: message.into(),
            code,
            details: None,
        }
    }

    /// HTTP status, 0 when no response was received
    pub fn status(&self) -> u16 {
        match self {
            BackendError::Unauthorized { status, .. }
            | BackendError::Network { status, .. }
            | BackendError::Api { status, .. } => *status,
            BackendError::Cors(_) | BackendError::Parse(_) => 0,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            BackendError::Unauthorized { message, .. }
            | BackendError::Network { message, .. }
            | BackendError::Api { message, .. } => message,
            BackendError::Cors(message) | BackendError::Parse(message) => message,
        }
    }

    /// Postgres/PostgREST error code, when the backend sent one
    pub fn sql_code(&self) -> Option<&str> {
        match self {
            BackendError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            BackendError::Unauthorized { .. } => ErrorType::Auth,
            BackendError::Network { .. } => ErrorType::Network,
            BackendError::Cors(_) => ErrorType::Cors,
            BackendError::Parse(_) => ErrorType::General,
            BackendError::Api { .. } => ErrorType::Api,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, BackendError::Unauthorized { .. })
    }

    /// The named server-side function is not installed
    pub fn is_missing_function(&self, function: &str) -> bool {
        if !matches!(self, BackendError::Api { .. }) {
            return false;
        }
        if self.sql_code() == Some("PGRST202") {
            return true;
        }
        let message = self.message().to_lowercase();
        if !message.contains(&function.to_lowercase()) {
            return false;
        }
        // 42883 also fires for unknown functions called from inside the user's SQL
        self.sql_code() == Some("42883")
            || message.contains("does not exist")
            || message.contains("could not find")
    }

    /// The referenced table or view is not present
    pub fn is_missing_relation(&self) -> bool {
        if !matches!(self, BackendError::Api { .. }) {
            return false;
        }
        if matches!(self.sql_code(), Some("42P01") | Some("PGRST205")) {
            return true;
        }
        let message = self.message().to_lowercase();
        message.contains("relation") && message.contains("does not exist")
    }
}

/// Split an edge function `{data?, error?}` body into a result
///
/// A 2xx response can still carry an application error, either as a string
/// or as a PostgREST-style `{message, code}` object.
pub fn function_result(body: Value) -> Result<Value, BackendError> {
    let mut map = match body {
        Value::Object(map) => map,
        other => return Ok(other),
    };

    match map.remove("error") {
        None | Some(Value::Null) => Ok(match map.remove("data") {
            Some(data) => data,
            None => Value::Object(map),
        }),
        Some(Value::String(message)) => Err(BackendError::application(message, None)),
        Some(Value::Object(error)) => {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Edge function reported an error")
                .to_string();
            let code = error.get("code").and_then(Value::as_str).map(String::from);
            Err(BackendError::application(message, code))
        }
        Some(other) => Err(BackendError::application(other.to_string(), None)),
    }
}

/// Async access to the hosted Postgres project
///
/// Every method is a single request. Retries, classification and
/// fallbacks live in the components above this trait.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// The authenticated session's user
    async fn current_user(&self) -> Result<Value, BackendError>;

    /// REST layer root (OpenAPI document)
    async fn rest_root(&self) -> Result<Value, BackendError>;

    /// Health endpoint
    async fn health(&self) -> Result<Value, BackendError>;

    /// CORS preflight against an edge function
    async fn preflight_function(&self, name: &str) -> Result<(), BackendError>;

    /// Invoke an edge function with a JSON body
    async fn invoke_function(&self, name: &str, body: Value) -> Result<Value, BackendError>;

    /// Call a database procedure over the REST layer
    async fn rpc(&self, function: &str, args: Value) -> Result<Value, BackendError>;

    /// Read rows from a table
    async fn select(&self, table: &str, query: SelectQuery) -> Result<Value, BackendError>;

    /// Insert one row into a table
    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError>;

    /// Run raw SQL through the meta query endpoint
    async fn run_query(&self, sql: &str) -> Result<Value, BackendError>;
}
