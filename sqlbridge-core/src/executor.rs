//! Remote SQL executor
//!
//! Order of work for one request:
//!
//! 1. reject empty SQL locally
//! 2. make sure the audit table exists (non-fatal)
//! 3. connection pre-check; only an auth failure stops here
//! 4. the edge function under the retry policy, bootstrapping the exec
//!    procedure inline (once) if the backend says it is missing
//! 5. the direct executor as fallback
//!
//! Each terminal path writes exactly one audit entry.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::backend::{function_result, Backend, BackendError};
use crate::bootstrap::{function_body, SchemaBootstrapper};
use crate::config::MigrationConfig;
use crate::direct::DirectExecutor;
use crate::error::{ErrorCode, OperationError};
use crate::probe::ConnectionProber;
use crate::recorder::{operation_type, MigrationLogRecorder, OperationData, OperationOutcome};
use crate::retry::{retry_with_backoff, RetryCallback, RetryDecision, RetryError};
use crate::trace::{AttemptRecord, DebugTrace, ExecutionResult};

/// Method name of the primary strategy
pub const EDGE_FUNCTION_METHOD: &str = "edge-function";
/// `method_used` for requests stopped by the connection pre-check
pub const AUTH_ERROR_METHOD: &str = "auth_error";
/// `method_used` for requests that panicked
pub const UNEXPECTED_METHOD: &str = "unexpected";

/// One SQL execution request
#[derive(Debug, Clone)]
pub struct SqlRequest {
    pub sql: String,
    pub max_retries: u32,
    /// Generated when absent
    pub operation_id: Option<String>,
    pub operation_type: String,
    /// Extra fields merged into the audit entry's `details`
    pub details: Value,
}

impl SqlRequest {
    pub fn new(sql: impl Into<String>, max_retries: u32) -> Self {
        Self {
            sql: sql.into(),
            max_retries,
            operation_id: None,
            operation_type: operation_type::CUSTOM_SQL.to_string(),
            details: Value::Null,
        }
    }

    pub fn operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    pub fn operation_type(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = operation_type.into();
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

pub struct SqlExecutor {
    backend: Arc<dyn Backend>,
    config: Arc<MigrationConfig>,
    prober: Arc<ConnectionProber>,
    recorder: Arc<MigrationLogRecorder>,
    bootstrapper: Arc<SchemaBootstrapper>,
    direct: Arc<dyn DirectExecutor>,
    on_retry: Option<RetryCallback>,
}

impl SqlExecutor {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: Arc<MigrationConfig>,
        prober: Arc<ConnectionProber>,
        recorder: Arc<MigrationLogRecorder>,
        bootstrapper: Arc<SchemaBootstrapper>,
        direct: Arc<dyn DirectExecutor>,
    ) -> Self {
        Self {
            backend,
            config,
            prober,
            recorder,
            bootstrapper,
            direct,
            on_retry: None,
        }
    }

    /// Called before each backoff delay
    pub fn with_retry_callback(mut self, callback: RetryCallback) -> Self {
        self.on_retry = Some(callback);
        self
    }

    /// Execute `sql` as a `custom_sql` operation
    pub async fn execute_sql(&self, sql: &str, max_retries: u32) -> ExecutionResult {
        self.execute(SqlRequest::new(sql, max_retries)).await
    }

    /// Execute a request; never panics and never returns `Err`
    pub async fn execute(&self, request: SqlRequest) -> ExecutionResult {
        let started = Instant::now();
        let operation_id = request
            .operation_id
            .clone()
            .unwrap_or_else(|| format!("sql_{}", Uuid::new_v4()));

        match AssertUnwindSafe(self.run(&request, &operation_id, started))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(operation_id = %operation_id, error = %message, "SQL execution panicked");

                let mut trace = DebugTrace::new(&operation_id);
                trace.finish(UNEXPECTED_METHOD);
                let result = ExecutionResult::err(
                    OperationError::new(
                        ErrorCode::UnexpectedError,
                        format!("Unexpected error: {}", message),
                    ),
                    trace,
                );
                self.record(&request, &operation_id, UNEXPECTED_METHOD, started, &result)
                    .await;
                result
            }
        }
    }

    async fn run(&self, request: &SqlRequest, operation_id: &str, started: Instant) -> ExecutionResult {
        let mut trace = DebugTrace::new(operation_id);
        let sql = request.sql.as_str();

        if sql.trim().is_empty() {
            trace.finish("validation");
            return ExecutionResult::err(
                OperationError::new(ErrorCode::EmptySql, "SQL query cannot be empty"),
                trace,
            );
        }

        match self.bootstrapper.ensure_audit_table().await {
            Ok(true) => trace.note("created audit table"),
            Ok(false) => {}
            Err(e) => trace.note(format!("audit table check failed: {}", e)),
        }

        let probe = self
            .prober
            .check_connection(self.config.preflight_retries)
            .await;
        if probe.is_auth_failure() {
            let error = probe.error.clone().unwrap_or_else(|| {
                OperationError::new(ErrorCode::AuthError, "Authentication failed")
            });
            tracing::warn!(operation_id, "connection check failed with an authentication error");
            trace.record_method(AUTH_ERROR_METHOD);
            trace.finish(AUTH_ERROR_METHOD);
            let result = ExecutionResult::err(error, trace);
            self.record(request, operation_id, AUTH_ERROR_METHOD, started, &result)
                .await;
            return result;
        }
        if let Some(error) = &probe.error {
            tracing::warn!(operation_id, error = %error, "connection check failed, executing anyway");
            trace.note(format!("connection check failed: {}", error));
        }

        let primary = self.run_edge_function(sql, operation_id, request.max_retries, &mut trace).await;
        match primary {
            Ok(data) => {
                trace.finish(EDGE_FUNCTION_METHOD);
                tracing::info!(operation_id, method = EDGE_FUNCTION_METHOD, "SQL executed");
                let result = ExecutionResult::ok(data, trace);
                self.record(request, operation_id, EDGE_FUNCTION_METHOD, started, &result)
                    .await;
                return result;
            }
            Err(RetryError::Aborted(e)) => {
                trace.finish(EDGE_FUNCTION_METHOD);
                tracing::warn!(operation_id, status = e.status(), "edge function rejected credentials");
                let error = OperationError::new(
                    ErrorCode::AuthError,
                    format!("Authentication failed: {}", e.message()),
                );
                let error = match e.status() {
                    0 => error,
                    status => error.with_status(status),
                };
                let result = ExecutionResult::err(error, trace);
                self.record(request, operation_id, EDGE_FUNCTION_METHOD, started, &result)
                    .await;
                return result;
            }
            Err(RetryError::Exhausted { last, attempts }) => {
                let last = last.map(|e| e.to_string()).unwrap_or_default();
                tracing::warn!(
                    operation_id,
                    attempts,
                    error = %last,
                    "edge function exhausted, falling back to direct execution"
                );
                trace.note(format!(
                    "edge function failed after {} attempts: {}",
                    attempts, last
                ));
            }
        }

        let fallback = self.direct.execute(sql, operation_id).await;
        for record in fallback.attempts {
            trace.push_attempt(record);
        }
        trace.record_method(&fallback.method);
        trace.finish(fallback.method.as_str());

        let result = ExecutionResult::from_outcome(fallback.result, trace);
        if result.is_success() {
            tracing::info!(operation_id, method = %fallback.method, "SQL executed");
        }
        self.record(request, operation_id, &fallback.method, started, &result)
            .await;
        result
    }

    /// The primary strategy; attempts are appended to `trace`
    async fn run_edge_function(
        &self,
        sql: &str,
        operation_id: &str,
        max_retries: u32,
        trace: &mut DebugTrace,
    ) -> Result<Value, RetryError<BackendError>> {
        let policy = self.config.retry.with_max_retries(max_retries);
        let state = Mutex::new(std::mem::replace(trace, DebugTrace::new(operation_id)));
        let shared = &state;
        let bootstrapped = AtomicBool::new(false);
        let bootstrapped = &bootstrapped;

        let outcome = retry_with_backoff(
            &policy,
            move |attempt| async move {
                if attempt == 0 {
                    if let Err(e) = self.backend.preflight_function(&self.config.sql_function).await {
                        tracing::warn!(operation_id, error = %e, "edge function preflight failed");
                        shared.lock().note(format!("preflight failed: {}", e));
                    }
                }

                tracing::debug!(operation_id, attempt, method = EDGE_FUNCTION_METHOD, "executing SQL");
                let result = self.invoke(sql, operation_id).await;
                let result = match result {
                    Err(e)
                        if e.is_missing_function(&self.config.exec_sql_function)
                            && !bootstrapped.swap(true, Ordering::SeqCst) =>
                    {
                        shared
                            .lock()
                            .push_attempt(AttemptRecord::failure(EDGE_FUNCTION_METHOD, attempt, &e));
                        tracing::info!(operation_id, "exec_sql function missing, bootstrapping");

                        let setup = self
                            .bootstrapper
                            .setup_exec_sql_function(self.config.retry.max_retries, true)
                            .await;
                        if setup.success {
                            shared.lock().note("exec_sql function bootstrapped");
                            self.invoke(sql, operation_id).await
                        } else {
                            match setup.error {
                                Some(err) if err.is_auth() => {
                                    shared.lock().note(format!("bootstrap rejected: {}", err.message));
                                    return Err(BackendError::Unauthorized {
                                        status: err.status.unwrap_or_default(),
                                        message: err.message,
                                    });
                                }
                                Some(err) => {
                                    shared.lock().note(format!("bootstrap failed: {}", err.message));
                                }
                                None => shared.lock().note("bootstrap failed"),
                            }
                            return Err(e);
                        }
                    }
                    other => other,
                };

                shared.lock().push_attempt(match &result {
                    Ok(_) => AttemptRecord::success(EDGE_FUNCTION_METHOD, attempt),
                    Err(e) => AttemptRecord::failure(EDGE_FUNCTION_METHOD, attempt, e),
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

        *trace = state.into_inner();
        trace.record_method(EDGE_FUNCTION_METHOD);
        outcome
    }

    async fn invoke(&self, sql: &str, operation_id: &str) -> Result<Value, BackendError> {
        let body = self
            .backend
            .invoke_function(&self.config.sql_function, function_body(sql, operation_id))
            .await?;
        function_result(body)
    }

    async fn record(
        &self,
        request: &SqlRequest,
        operation_id: &str,
        method: &str,
        started: Instant,
        result: &ExecutionResult,
    ) {
        let details = match &request.details {
            Value::Null => json!({}),
            details => details.clone(),
        };
        self.recorder
            .safely_log_operation(
                OperationData::new(operation_id, request.operation_type.as_str(), method)
                    .sql(request.sql.as_str())
                    .details(details),
                started,
                OperationOutcome::from(result),
            )
            .await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
