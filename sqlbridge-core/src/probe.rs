//! Connection prober
//!
//! Runs independent reachability strategies in order, each with its own
//! retry budget. The first success wins; the first authentication failure
//! ends the whole probe, since retrying other endpoints would only hide it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::StatusCode;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::backend::{Backend, BackendError};
use crate::config::MigrationConfig;
use crate::error::{ErrorCode, ErrorType, OperationError};
use crate::retry::{retry_with_backoff, RetryCallback, RetryDecision, RetryError};
use crate::sql::NOOP_SQL;

/// One way of checking that the backend answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeStrategy {
    /// Session/identity check
    AuthSession,
    /// REST layer root
    RestRoot,
    /// Health endpoint
    Health,
    /// CORS preflight against the SQL edge function
    FunctionCors,
    /// `SELECT 1` through the exec procedure
    ExecSqlRpc,
}

impl ProbeStrategy {
    pub const ALL: [ProbeStrategy; 5] = [
        ProbeStrategy::AuthSession,
        ProbeStrategy::RestRoot,
        ProbeStrategy::Health,
        ProbeStrategy::FunctionCors,
        ProbeStrategy::ExecSqlRpc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProbeStrategy::AuthSession => "auth-session",
            ProbeStrategy::RestRoot => "rest-root",
            ProbeStrategy::Health => "health",
            ProbeStrategy::FunctionCors => "function-cors",
            ProbeStrategy::ExecSqlRpc => "exec-sql-rpc",
        }
    }
}

/// Output of one probe attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionProbeResult {
    pub strategy: ProbeStrategy,
    pub attempt: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    pub error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionProbeResult {
    fn passed(strategy: ProbeStrategy, attempt: u32) -> Self {
        Self {
            strategy,
            attempt,
            success: true,
            status: None,
            status_text: None,
            error_type: None,
            error: None,
        }
    }

    fn failed(strategy: ProbeStrategy, attempt: u32, err: &BackendError) -> Self {
        let status = err.status();
        Self {
            strategy,
            attempt,
            success: false,
            status: (status != 0).then_some(status),
            status_text: status_text(status).map(String::from),
            error_type: Some(err.error_type()),
            error: Some(err.message().to_string()),
        }
    }
}

/// Trace of a whole probe run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeTrace {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub probes: Vec<ConnectionProbeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful_strategy: Option<ProbeStrategy>,
}

/// Result of [`ConnectionProber::check_connection`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    pub debug_info: ProbeTrace,
}

impl ConnectionReport {
    pub fn is_auth_failure(&self) -> bool {
        self.error.as_ref().is_some_and(OperationError::is_auth)
    }
}

pub struct ConnectionProber {
    backend: Arc<dyn Backend>,
    config: Arc<MigrationConfig>,
    on_retry: Option<RetryCallback>,
}

impl ConnectionProber {
    pub fn new(backend: Arc<dyn Backend>, config: Arc<MigrationConfig>) -> Self {
        Self {
            backend,
            config,
            on_retry: None,
        }
    }

    /// Called before each backoff delay
    pub fn with_retry_callback(mut self, callback: RetryCallback) -> Self {
        self.on_retry = Some(callback);
        self
    }

    /// Probe every strategy, `max_retries` attempts each
    pub async fn check_connection(&self, max_retries: u32) -> ConnectionReport {
        let started_at = Utc::now();
        let policy = self.config.retry.with_max_retries(max_retries);
        let probes = Mutex::new(Vec::new());
        let log = &probes;

        for strategy in ProbeStrategy::ALL {
            let outcome = retry_with_backoff(
                &policy,
                move |attempt| {
                    async move {
                        let result = self.run(strategy).await;
                        log.lock().push(match &result {
                            Ok(()) => ConnectionProbeResult::passed(strategy, attempt),
                            Err(e) => ConnectionProbeResult::failed(strategy, attempt, e),
                        });
                        result
                    }
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

            match outcome {
                Ok(()) => {
                    tracing::debug!(strategy = strategy.name(), "connection probe succeeded");
                    return ConnectionReport {
                        success: true,
                        error: None,
                        debug_info: ProbeTrace {
                            started_at,
                            finished_at: Utc::now(),
                            probes: probes.into_inner(),
                            successful_strategy: Some(strategy),
                        },
                    };
                }
                Err(RetryError::Aborted(e)) => {
                    tracing::warn!(
                        strategy = strategy.name(),
                        status = e.status(),
                        "connection probe hit an authentication failure"
                    );
                    let error = OperationError::new(
                        ErrorCode::AuthError,
                        format!("Authentication failed: {}", e.message()),
                    )
                    .with_details(json!({ "strategy": strategy.name() }));
                    let error = match e.status() {
                        0 => error,
                        status => error.with_status(status),
                    };
                    return ConnectionReport {
                        success: false,
                        error: Some(error),
                        debug_info: ProbeTrace {
                            started_at,
                            finished_at: Utc::now(),
                            probes: probes.into_inner(),
                            successful_strategy: None,
                        },
                    };
                }
                Err(RetryError::Exhausted { .. }) => {
                    tracing::debug!(strategy = strategy.name(), "connection probe exhausted");
                }
            }
        }

        let probes = probes.into_inner();
        let error = aggregate_failures(&probes);
        tracing::warn!(code = %error.code, "all connection probes failed");
        ConnectionReport {
            success: false,
            error: Some(error),
            debug_info: ProbeTrace {
                started_at,
                finished_at: Utc::now(),
                probes,
                successful_strategy: None,
            },
        }
    }

    async fn run(&self, strategy: ProbeStrategy) -> Result<(), BackendError> {
        match strategy {
            ProbeStrategy::AuthSession => self.backend.current_user().await.map(|_| ()),
            ProbeStrategy::RestRoot => self.backend.rest_root().await.map(|_| ()),
            ProbeStrategy::Health => self.backend.health().await.map(|_| ()),
            ProbeStrategy::FunctionCors => {
                self.backend
                    .preflight_function(&self.config.sql_function)
                    .await
            }
            ProbeStrategy::ExecSqlRpc => self
                .backend
                .rpc(
                    &self.config.exec_sql_function,
                    json!({ "sql_text": NOOP_SQL }),
                )
                .await
                .map(|_| ()),
        }
    }
}

/// Summarize a run where nothing succeeded
fn aggregate_failures(probes: &[ConnectionProbeResult]) -> OperationError {
    let failures: Vec<_> = probes.iter().filter_map(|p| p.error_type).collect();

    let (code, message) = if failures.is_empty() {
        (ErrorCode::ConnectionError, "No connection probes were run".to_string())
    } else if failures.iter().all(|t| *t == ErrorType::Network) {
        (
            ErrorCode::NetworkError,
            "Backend unreachable: every probe failed with a network error".to_string(),
        )
    } else if failures.iter().all(|t| *t == ErrorType::Auth) {
        (
            ErrorCode::AuthError,
            "Authentication failed on every probe".to_string(),
        )
    } else {
        let last = probes
            .iter()
            .rev()
            .find_map(|p| p.error.clone())
            .unwrap_or_default();
        (
            ErrorCode::ConnectionError,
            format!("All connection probes failed (last error: {})", last),
        )
    };

    OperationError::new(code, message).with_details(json!({ "probes": probes.len() }))
}

/// Canonical reason phrase, `None` for status 0 and unregistered codes
fn status_text(status: u16) -> Option<&'static str> {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(error_type: ErrorType) -> ConnectionProbeResult {
        ConnectionProbeResult {
            strategy: ProbeStrategy::Health,
            attempt: 0,
            success: false,
            status: None,
            status_text: None,
            error_type: Some(error_type),
            error: Some(format!("{:?}", error_type)),
        }
    }

    #[test]
    fn test_aggregate_all_network() {
        let err = aggregate_failures(&[failure(ErrorType::Network), failure(ErrorType::Network)]);
        assert_eq!(err.code, ErrorCode::NetworkError);
    }

    #[test]
    fn test_aggregate_all_auth() {
        let err = aggregate_failures(&[failure(ErrorType::Auth)]);
        assert_eq!(err.code, ErrorCode::AuthError);
    }

    #[test]
    fn test_aggregate_mixed() {
        let err = aggregate_failures(&[failure(ErrorType::Network), failure(ErrorType::Cors)]);
        assert_eq!(err.code, ErrorCode::ConnectionError);
        assert!(err.message.contains("Cors"));
    }

    #[test]
    fn test_strategy_names() {
        let names: Vec<_> = ProbeStrategy::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec!["auth-session", "rest-root", "health", "function-cors", "exec-sql-rpc"]
        );
    }

    #[test]
    fn test_failed_probe_result() {
        let result = ConnectionProbeResult::failed(
            ProbeStrategy::RestRoot,
            1,
            &BackendError::Network {
                status: 503,
                message: "unavailable".into(),
            },
        );
        assert_eq!(result.status, Some(503));
        assert_eq!(result.status_text.as_deref(), Some("Service Unavailable"));
        assert_eq!(result.error_type, Some(ErrorType::Network));
    }

    #[test]
    fn test_status_text_covers_registered_codes() {
        assert_eq!(status_text(408), Some("Request Timeout"));
        assert_eq!(status_text(422), Some("Unprocessable Entity"));
        assert_eq!(status_text(423), Some("Locked"));
        assert_eq!(status_text(0), None);
        assert_eq!(status_text(599), None);
    }
}
