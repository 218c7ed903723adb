//! Schema bootstrapper
//!
//! Installs the exec procedure and the audit table when they are missing.
//! Creation strategies run in priority order, each under the shared retry
//! policy. A strategy only counts once `SELECT 1` through the procedure
//! succeeds afterwards; a failed verification moves straight on to the next
//! strategy. A 401/403 from any strategy or from verification ends the
//! setup with `AUTH_ERROR`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::backend::{function_result, Backend, BackendError};
use crate::config::MigrationConfig;
use crate::direct::DirectExecutor;
use crate::error::{ErrorCode, OperationError};
use crate::recorder::{
    operation_type, strategy_details, MigrationLogRecorder, OperationData, OperationOutcome,
};
use crate::retry::{retry_with_backoff, RetryCallback, RetryDecision, RetryError};
use crate::sql;
use crate::trace::{AttemptRecord, DebugTrace};

const VERIFY_METHOD: &str = "verify";

/// A way of getting the procedure's DDL executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetupStrategy {
    /// Send the DDL through the SQL edge function
    EdgeFunction,
    /// Confirm the procedure answers, then replace it through itself
    RpcReplace,
    /// Raw SQL over the meta query endpoint
    RestQuery,
    /// Hand the DDL to the direct executor
    FallbackExecutor,
}

impl SetupStrategy {
    /// Priority order
    pub const ALL: [SetupStrategy; 4] = [
        SetupStrategy::EdgeFunction,
        SetupStrategy::RpcReplace,
        SetupStrategy::RestQuery,
        SetupStrategy::FallbackExecutor,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SetupStrategy::EdgeFunction => "edge-function",
            SetupStrategy::RpcReplace => "rpc-replace",
            SetupStrategy::RestQuery => "rest-query",
            SetupStrategy::FallbackExecutor => "fallback-executor",
        }
    }
}

/// Result of [`SchemaBootstrapper::setup_exec_sql_function`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    pub debug_info: DebugTrace,
}

pub struct SchemaBootstrapper {
    backend: Arc<dyn Backend>,
    config: Arc<MigrationConfig>,
    recorder: Arc<MigrationLogRecorder>,
    direct: Arc<dyn DirectExecutor>,
    on_retry: Option<RetryCallback>,
}

impl SchemaBootstrapper {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: Arc<MigrationConfig>,
        recorder: Arc<MigrationLogRecorder>,
        direct: Arc<dyn DirectExecutor>,
    ) -> Self {
        Self {
            backend,
            config,
            recorder,
            direct,
            on_retry: None,
        }
    }

    /// Called before each backoff delay
    pub fn with_retry_callback(mut self, callback: RetryCallback) -> Self {
        self.on_retry = Some(callback);
        self
    }

    /// Install (or refresh) the exec procedure
    ///
    /// Safe to call when everything is already in place: the first strategy
    /// re-runs `CREATE OR REPLACE` and the verification round-trip passes.
    pub async fn setup_exec_sql_function(&self, max_retries: u32, log_results: bool) -> SetupReport {
        let started = Instant::now();
        let operation_id = format!("setup_{}", Uuid::new_v4());
        let mut trace = DebugTrace::new(&operation_id);
        let ddl = sql::exec_sql_function(&self.config.exec_sql_function);
        let policy = self.config.retry.with_max_retries(max_retries);

        let can_log = log_results
            && match self.recorder.table_exists().await {
                Ok(true) => true,
                Ok(false) => {
                    trace.note("audit table missing, setup will not be logged");
                    false
                }
                Err(e) => {
                    trace.note(format!("audit table unreachable: {}", e));
                    false
                }
            };

        for strategy in SetupStrategy::ALL {
            tracing::debug!(
                operation_id = %operation_id,
                method = strategy.name(),
                "trying exec_sql setup strategy"
            );

            let attempts = Mutex::new(Vec::new());
            let log = &attempts;
            let ddl_ref = ddl.as_str();
            let op_id = operation_id.as_str();

            let outcome = retry_with_backoff(
                &policy,
                move |attempt| async move {
                    let result = self.create_with(strategy, ddl_ref, op_id).await;
                    log.lock().push(match &result {
                        Ok(()) => AttemptRecord::success(strategy.name(), attempt),
                        Err(e) => AttemptRecord::failure(strategy.name(), attempt, e),
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

            let attempts = attempts.into_inner();
            let last_attempt = attempts.last().map(|a| a.attempt).unwrap_or_default();
            for record in attempts {
                trace.push_attempt(record);
            }

            let failure = match outcome {
                Ok(()) => None,
                Err(RetryError::Aborted(e)) => Some(e),
                Err(RetryError::Exhausted { last, .. }) => last,
            };

            if let Some(e) = failure {
                if e.is_auth() {
                    return self
                        .rejected(&e, strategy.name(), trace, &ddl, started, can_log)
                        .await;
                }
                tracing::warn!(
                    operation_id = %operation_id,
                    method = strategy.name(),
                    error = %e,
                    "exec_sql setup strategy failed"
                );
                if can_log {
                    let error = OperationError::from(&e);
                    self.recorder
                        .safely_log_operation(
                            OperationData::new(
                                &operation_id,
                                operation_type::SETUP_EXEC_SQL,
                                strategy.name(),
                            )
                            .sql(ddl.as_str())
                            .details(strategy_details(strategy.name(), Some(last_attempt), json!({}))),
                            started,
                            OperationOutcome::failed(&error, None),
                        )
                        .await;
                }
                continue;
            }

            if max_retries == 0 {
                break;
            }

            match self.verify().await {
                Ok(_) => {
                    trace.push_attempt(AttemptRecord::success(VERIFY_METHOD, 0));
                    trace.finish(strategy.name());
                    tracing::info!(
                        operation_id = %operation_id,
                        method = strategy.name(),
                        "exec_sql function installed and verified"
                    );
                    if can_log {
                        self.recorder
                            .safely_log_operation(
                                OperationData::new(
                                    &operation_id,
                                    operation_type::SETUP_EXEC_SQL,
                                    strategy.name(),
                                )
                                .sql(ddl.as_str())
                                .details(strategy_details(
                                    strategy.name(),
                                    None,
                                    json!({ "verified": true }),
                                )),
                                started,
                                OperationOutcome::succeeded(Some(&trace)),
                            )
                            .await;
                    }
                    return SetupReport {
                        success: true,
                        error: None,
                        debug_info: trace,
                    };
                }
                Err(e) => {
                    trace.push_attempt(AttemptRecord::failure(VERIFY_METHOD, 0, &e));
                    if e.is_auth() {
                        return self
                            .rejected(&e, strategy.name(), trace, &ddl, started, can_log)
                            .await;
                    }
                    tracing::warn!(
                        operation_id = %operation_id,
                        method = strategy.name(),
                        error = %e,
                        "exec_sql verification failed"
                    );
                    if can_log {
                        let error = OperationError::from(&e);
                        self.recorder
                            .safely_log_operation(
                                OperationData::new(
                                    &operation_id,
                                    operation_type::VERIFY_EXEC_SQL,
                                    strategy.name(),
                                )
                                .sql(sql::NOOP_SQL)
                                .details(strategy_details(
                                    strategy.name(),
                                    None,
                                    json!({ "verified": false }),
                                )),
                                started,
                                OperationOutcome::failed(&error, None),
                            )
                            .await;
                    }
                }
            }
        }

        trace.finish("none");
        let error = OperationError::new(
            ErrorCode::SetupFailed,
            "All methods to create exec_sql function failed",
        )
        .with_details(json!({
            "strategies": SetupStrategy::ALL.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "attempts": trace.attempts.len(),
        }));

        if can_log {
            self.recorder
                .safely_log_operation(
                    OperationData::new(&operation_id, operation_type::SETUP_EXEC_SQL, "all")
                        .sql(ddl.as_str()),
                    started,
                    OperationOutcome::failed(&error, Some(&trace)),
                )
                .await;
        }

        SetupReport {
            success: false,
            error: Some(error),
            debug_info: trace,
        }
    }

    /// Stop the setup on a 401/403; credentials will not improve with other strategies
    async fn rejected(
        &self,
        err: &BackendError,
        method: &str,
        mut trace: DebugTrace,
        ddl: &str,
        started: Instant,
        can_log: bool,
    ) -> SetupReport {
        trace.finish(method);
        let error = OperationError::from(err);
        tracing::warn!(
            operation_id = %trace.operation_id,
            method,
            status = err.status(),
            "exec_sql setup rejected credentials"
        );

        if can_log {
            self.recorder
                .safely_log_operation(
                    OperationData::new(
                        trace.operation_id.as_str(),
                        operation_type::SETUP_EXEC_SQL,
                        method,
                    )
                    .sql(ddl)
                    .details(strategy_details(method, None, json!({}))),
                    started,
                    OperationOutcome::failed(&error, Some(&trace)),
                )
                .await;
        }

        SetupReport {
            success: false,
            error: Some(error),
            debug_info: trace,
        }
    }

    /// Create the audit table if it is missing; `Ok(true)` when it was created
    pub async fn ensure_audit_table(&self) -> Result<bool, BackendError> {
        if self.recorder.table_exists().await? {
            return Ok(false);
        }

        let ddl = sql::migration_logs_table(self.recorder.table());
        let via_rpc = self
            .backend
            .rpc(&self.config.exec_sql_function, json!({ "sql_text": ddl }))
            .await;

        match via_rpc {
            Ok(_) => {}
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "creating audit table over RPC failed, using edge function");
                let body = self
                    .backend
                    .invoke_function(&self.config.sql_function, function_body(&ddl, "ensure_audit_table"))
                    .await?;
                function_result(body)?;
            }
        }

        tracing::info!(table = self.recorder.table(), "created audit table");
        Ok(true)
    }

    async fn create_with(
        &self,
        strategy: SetupStrategy,
        ddl: &str,
        operation_id: &str,
    ) -> Result<(), BackendError> {
        match strategy {
            SetupStrategy::EdgeFunction => {
                let body = self
                    .backend
                    .invoke_function(&self.config.sql_function, function_body(ddl, operation_id))
                    .await?;
                function_result(body).map(|_| ())
            }
            SetupStrategy::RpcReplace => {
                let function = &self.config.exec_sql_function;
                self.backend
                    .rpc(function, json!({ "sql_text": sql::NOOP_SQL }))
                    .await?;
                self.backend
                    .rpc(function, json!({ "sql_text": ddl }))
                    .await
                    .map(|_| ())
            }
            SetupStrategy::RestQuery => self.backend.run_query(ddl).await.map(|_| ()),
            SetupStrategy::FallbackExecutor => {
                match AssertUnwindSafe(self.direct.execute(ddl, operation_id))
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome.result.map(|_| ()).map_err(into_backend_error),
                    Err(_) => Err(BackendError::Api {
                        status: 0,
                        message: "direct executor panicked".to_string(),
                        code: None,
                        details: None,
                    }),
                }
            }
        }
    }

    async fn verify(&self) -> Result<Value, BackendError> {
        self.backend
            .rpc(
                &self.config.exec_sql_function,
                json!({ "sql_text": sql::NOOP_SQL }),
            )
            .await
    }
}

/// Request body for the SQL edge function
pub(crate) fn function_body(sql: &str, operation_id: &str) -> Value {
    json!({
        "sql": sql,
        "sql_text": sql,
        "debug": true,
        "operation_id": operation_id,
    })
}

fn into_backend_error(err: OperationError) -> BackendError {
    let status = err.status.unwrap_or_default();
    match err.code {
        ErrorCode::AuthError => BackendError::Unauthorized {
            status,
            message: err.message,
        },
        ErrorCode::NetworkError => BackendError::Network {
            status,
            message: err.message,
        },
        ErrorCode::CorsError => BackendError::Cors(err.message),
        ErrorCode::ParseError => BackendError::Parse(err.message),
        _ => BackendError::Api {
            status,
            message: err.message,
            code: None,
            details: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_priority() {
        let names: Vec<_> = SetupStrategy::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec!["edge-function", "rpc-replace", "rest-query", "fallback-executor"]
        );
    }

    #[test]
    fn test_function_body_carries_both_sql_keys() {
        let body = function_body("SELECT 1", "op_1");
        assert_eq!(body["sql"], "SELECT 1");
        assert_eq!(body["sql_text"], "SELECT 1");
        assert_eq!(body["operation_id"], "op_1");
        assert_eq!(body["debug"], true);
    }

    #[test]
    fn test_into_backend_error_keeps_auth() {
        let err = into_backend_error(
            OperationError::new(ErrorCode::AuthError, "forbidden").with_status(403),
        );
        assert!(err.is_auth());
        assert_eq!(err.status(), 403);

        let err = into_backend_error(OperationError::new(ErrorCode::SqlError, "syntax"));
        assert!(matches!(err, BackendError::Api { status: 0, .. }));
    }
}
