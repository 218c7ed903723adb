//! Fallback execution path

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::backend::{Backend, BackendError};
use crate::error::{ErrorCode, OperationError};
use crate::retry::{retry_with_backoff, RetryCallback, RetryDecision, RetryError, RetryPolicy};
use crate::trace::AttemptRecord;

/// What a [`DirectExecutor`] reports back
#[derive(Debug, Clone, PartialEq)]
pub struct DirectOutcome {
    /// Method name recorded in the trace and the audit log
    pub method: String,
    pub result: Result<Value, OperationError>,
    /// Attempts in chronological order, merged into the caller's trace
    pub attempts: Vec<AttemptRecord>,
}

/// Executes SQL without going through the edge function
///
/// Used as the executor's fallback once the primary strategy is exhausted,
/// and as the bootstrapper's last-resort strategy. Implementations must
/// report failures in [`DirectOutcome::result`] rather than panicking.
#[async_trait]
pub trait DirectExecutor: Send + Sync {
    async fn execute(&self, sql: &str, operation_id: &str) -> DirectOutcome;
}

/// Calls the exec procedure over RPC
pub struct RpcDirectExecutor {
    backend: Arc<dyn Backend>,
    function: String,
    policy: RetryPolicy,
    on_retry: Option<RetryCallback>,
}

impl RpcDirectExecutor {
    pub const METHOD: &'static str = "direct-rpc";

    pub fn new(backend: Arc<dyn Backend>, function: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            function: function.into(),
            policy,
            on_retry: None,
        }
    }

    /// Called before each backoff delay
    pub fn with_retry_callback(mut self, callback: RetryCallback) -> Self {
        self.on_retry = Some(callback);
        self
    }
}

#[async_trait]
impl DirectExecutor for RpcDirectExecutor {
    async fn execute(&self, sql: &str, operation_id: &str) -> DirectOutcome {
        let attempts = Mutex::new(Vec::new());
        let log = &attempts;
        let backend = &self.backend;
        let function = self.function.as_str();

        let outcome = retry_with_backoff(
            &self.policy,
            move |attempt| async move {
                tracing::debug!(operation_id, attempt, method = Self::METHOD, "executing SQL");
                let result = backend.rpc(function, json!({ "sql_text": sql })).await;
                log.lock().push(match &result {
                    Ok(_) => AttemptRecord::success(Self::METHOD, attempt),
                    Err(e) => AttemptRecord::failure(Self::METHOD, attempt, e),
                });
                result
            },
            |e: &BackendError| {
                if e.is_auth() {
                    RetryDecision::Abort
                } else {
                    RetryDecision::Retry
                }
            },
            self.on_retry.as_ref(),
        )
        .await;

        let result = match outcome {
            Ok(data) => Ok(data),
            Err(RetryError::Aborted(e)) => Err(OperationError::from(&e)),
            Err(RetryError::Exhausted {
                last: Some(e),
                attempts,
            }) => Err(OperationError::from(&e).with_details(json!({
                "method": Self::METHOD,
                "attempts": attempts,
                "sql_state": e.sql_code(),
            }))),
            Err(RetryError::Exhausted { last: None, .. }) => Err(OperationError::new(
                ErrorCode::EdgeFunctionError,
                "Direct execution was not attempted",
            )),
        };

        DirectOutcome {
            method: Self::METHOD.to_string(),
            result,
            attempts: attempts.into_inner(),
        }
    }
}
