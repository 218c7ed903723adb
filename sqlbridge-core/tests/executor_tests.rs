mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{logs_of_type, system, system_with_direct, PanickingDirectExecutor, StubDirectExecutor, LOGS};
use serde_json::json;
use sqlbridge_core::test_utils::{network_down, unauthorized, Endpoint, MockBackend};
use sqlbridge_core::{BackendError, ErrorCode, ErrorType};

#[tokio::test(start_paused = true)]
async fn test_empty_sql_makes_no_calls() {
    let backend = MockBackend::new();
    let system = system(&backend);

    for sql in ["", "   ", "\n\t"] {
        let result = system.run_custom_sql(sql, None).await;
        assert!(!result.is_success());
        assert_eq!(result.error().unwrap().code, ErrorCode::EmptySql);
    }

    assert_eq!(backend.call_count(), 0);
    assert!(backend.rows(LOGS).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_healthy_backend_logs_one_success() {
    let backend = MockBackend::new();
    let system = system(&backend);

    let result = system.run_custom_sql("SELECT 1", None).await;

    assert!(result.is_success(), "{:?}", result.error());
    assert_eq!(result.data(), Some(&json!({ "success": true })));
    assert_eq!(result.debug_info.final_method.as_deref(), Some("edge-function"));

    let rows = backend.rows(LOGS);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "success");
    assert_eq!(rows[0]["method_used"], "edge-function");
    assert_eq!(rows[0]["operation_type"], "custom_sql");
    assert_eq!(rows[0]["sql_content"], "SELECT 1");
}

#[tokio::test(start_paused = true)]
async fn test_operation_id_is_carried_everywhere() {
    let backend = MockBackend::new();
    let system = system(&backend);

    let result = system.run_custom_sql("SELECT 1", None).await;
    let operation_id = result.debug_info.operation_id.clone();

    let invoke = &backend.calls_to(Endpoint::InvokeFunction)[0];
    assert_eq!(invoke.payload["operation_id"], operation_id.as_str());
    assert_eq!(invoke.payload["sql"], "SELECT 1");
    assert_eq!(invoke.payload["sql_text"], "SELECT 1");
    assert_eq!(backend.rows(LOGS)[0]["operation_id"], operation_id.as_str());
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_from_edge_function_is_terminal() {
    let backend = MockBackend::new().script(Endpoint::InvokeFunction, Err(unauthorized()));
    let direct = StubDirectExecutor::succeeding();
    let system = system_with_direct(&backend, direct.clone());

    let result = system.run_custom_sql("SELECT 1", Some(5)).await;

    let error = result.error().unwrap();
    assert_eq!(error.code, ErrorCode::AuthError);
    assert_eq!(error.status, Some(401));
    assert_eq!(backend.calls_to(Endpoint::InvokeFunction).len(), 1);
    assert_eq!(direct.calls(), 0);

    let rows = backend.rows(LOGS);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "failed");
    assert_eq!(rows[0]["method_used"], "edge-function");
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_from_probe_stops_before_execution() {
    let backend = MockBackend::new().fail(Endpoint::CurrentUser, unauthorized());
    let system = system(&backend);

    let result = system.run_custom_sql("SELECT 1", None).await;

    assert_eq!(result.error().unwrap().code, ErrorCode::AuthError);
    assert_eq!(result.debug_info.final_method.as_deref(), Some("auth_error"));
    assert!(backend.calls_to(Endpoint::InvokeFunction).is_empty());
    assert!(backend.calls_to(Endpoint::RestRoot).is_empty());

    let rows = backend.rows(LOGS);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["method_used"], "auth_error");
}

#[tokio::test(start_paused = true)]
async fn test_network_failures_fall_back_to_direct_executor() {
    let backend = MockBackend::new().fail(Endpoint::InvokeFunction, network_down());
    let direct = StubDirectExecutor::succeeding();
    let system = system_with_direct(&backend, direct.clone());

    let result = system.run_custom_sql("SELECT 1", None).await;

    assert!(result.is_success());
    assert_eq!(result.data(), Some(&json!({ "via": "stub" })));
    assert_eq!(backend.calls_to(Endpoint::InvokeFunction).len(), 2);
    assert_eq!(direct.calls(), 1);

    let trace = &result.debug_info;
    assert_eq!(trace.final_method.as_deref(), Some("stub-direct"));
    assert_eq!(trace.methods, vec!["edge-function", "stub-direct"]);
    assert_eq!(trace.attempts.len(), 2);
    assert!(trace
        .attempts
        .iter()
        .all(|a| !a.success && a.error_type == Some(ErrorType::Network)));

    let rows = backend.rows(LOGS);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["method_used"], "stub-direct");
    assert_eq!(rows[0]["status"], "success");
}

#[tokio::test(start_paused = true)]
async fn test_default_fallback_uses_exec_sql_rpc() {
    let backend = MockBackend::new().fail(Endpoint::InvokeFunction, network_down());
    let system = system(&backend);

    let result = system.run_custom_sql("SELECT 42", None).await;

    assert!(result.is_success());
    let trace = &result.debug_info;
    assert_eq!(trace.final_method.as_deref(), Some("direct-rpc"));
    let last = trace.attempts.last().unwrap();
    assert_eq!(last.method, "direct-rpc");
    assert!(last.success);

    let rpc_sql: Vec<_> = backend
        .calls_to(Endpoint::Rpc)
        .into_iter()
        .filter_map(|c| c.sql().map(String::from))
        .collect();
    assert_eq!(rpc_sql, vec!["SELECT 42"]);
}

#[tokio::test(start_paused = true)]
async fn test_application_errors_are_retried() {
    let syntax_error = json!({ "error": { "message": "syntax error at or near \"SELEC\"", "code": "42601" } });
    let backend = MockBackend::new()
        .script(Endpoint::InvokeFunction, Ok(syntax_error.clone()))
        .script(Endpoint::InvokeFunction, Ok(syntax_error));
    let direct = StubDirectExecutor::failing();
    let system = system_with_direct(&backend, direct.clone());

    let result = system.run_custom_sql("SELEC 1", None).await;

    assert_eq!(backend.calls_to(Endpoint::InvokeFunction).len(), 2);
    assert_eq!(direct.calls(), 1);
    assert_eq!(result.error().unwrap().code, ErrorCode::SqlError);
    assert!(result
        .debug_info
        .attempts
        .iter()
        .all(|a| a.error_type == Some(ErrorType::Api)));
    assert_eq!(backend.rows(LOGS)[0]["status"], "failed");
}

#[tokio::test(start_paused = true)]
async fn test_missing_exec_sql_bootstraps_once_and_succeeds() {
    let backend = MockBackend::new().without_exec_sql();
    let system = system(&backend);

    // A single attempt is enough: the retry after bootstrap is free
    let result = system.run_custom_sql("SELECT 1", Some(1)).await;

    assert!(result.is_success(), "{:?}", result.error());
    assert!(backend.has_function("exec_sql"));

    let ddl_calls = backend
        .calls_to(Endpoint::InvokeFunction)
        .into_iter()
        .filter(|c| c.sql().is_some_and(|sql| sql.contains("CREATE OR REPLACE FUNCTION")))
        .count();
    assert_eq!(ddl_calls, 1);
    assert_eq!(backend.calls_to(Endpoint::InvokeFunction).len(), 3);

    let setup = logs_of_type(&backend, "setup_exec_sql");
    assert_eq!(setup.len(), 1);
    assert_eq!(setup[0]["status"], "success");

    let custom = logs_of_type(&backend, "custom_sql");
    assert_eq!(custom.len(), 1);
    assert_eq!(custom[0]["status"], "success");

    assert!(result
        .debug_info
        .notes
        .iter()
        .any(|n| n == "exec_sql function bootstrapped"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_bootstrap_is_not_repeated() {
    let missing = json!({ "error": { "message": "function exec_sql(text) does not exist", "code": "42883" } });
    let backend = MockBackend::new()
        .without_exec_sql()
        .script(Endpoint::InvokeFunction, Ok(missing))
        .script(Endpoint::InvokeFunction, Err(network_down()))
        .script(Endpoint::InvokeFunction, Err(network_down()))
        .fail(Endpoint::RunQuery, network_down());
    let direct = StubDirectExecutor::failing();
    let system = system_with_direct(&backend, direct.clone());

    let result = system.run_custom_sql("SELECT 1", None).await;

    assert!(!result.is_success());
    let ddl_calls = backend
        .calls_to(Endpoint::InvokeFunction)
        .into_iter()
        .filter(|c| c.sql().is_some_and(|sql| sql.contains("CREATE OR REPLACE FUNCTION")))
        .count();
    assert_eq!(ddl_calls, 2);
    // two bootstrap attempts through the fallback strategy, one final fallback
    assert_eq!(direct.calls(), 3);
    assert!(result
        .debug_info
        .notes
        .iter()
        .any(|n| n.starts_with("bootstrap failed")));

    let setup = logs_of_type(&backend, "setup_exec_sql");
    // one per strategy plus the aggregate
    assert_eq!(setup.len(), 5);
    assert!(setup.iter().all(|row| row["status"] == "failed"));
    assert_eq!(logs_of_type(&backend, "custom_sql").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_during_bootstrap_is_terminal() {
    let missing = json!({ "error": { "message": "function exec_sql(text) does not exist", "code": "42883" } });
    let backend = MockBackend::new()
        .without_exec_sql()
        .script(Endpoint::InvokeFunction, Ok(missing))
        .script(Endpoint::InvokeFunction, Err(unauthorized()));
    let direct = StubDirectExecutor::succeeding();
    let system = system_with_direct(&backend, direct.clone());

    let result = system.run_custom_sql("SELECT 1", None).await;

    let error = result.error().unwrap();
    assert_eq!(error.code, ErrorCode::AuthError);
    assert_eq!(error.status, Some(401));
    assert_eq!(direct.calls(), 0);
    assert_eq!(backend.calls_to(Endpoint::InvokeFunction).len(), 2);
    assert!(result
        .debug_info
        .notes
        .iter()
        .any(|n| n.starts_with("bootstrap rejected")));

    let setup = logs_of_type(&backend, "setup_exec_sql");
    assert_eq!(setup.len(), 1);
    assert_eq!(setup[0]["status"], "failed");
    let custom = logs_of_type(&backend, "custom_sql");
    assert_eq!(custom.len(), 1);
    assert_eq!(custom[0]["method_used"], "edge-function");
}

#[tokio::test(start_paused = true)]
async fn test_preflight_failure_only_warns() {
    let backend = MockBackend::new().script(
        Endpoint::Preflight,
        Err(BackendError::Cors("Preflight returned HTTP 404 Not Found".into())),
    );
    let system = system(&backend);

    let result = system.run_custom_sql("SELECT 1", None).await;

    assert!(result.is_success());
    assert!(result
        .debug_info
        .notes
        .iter()
        .any(|n| n.starts_with("preflight failed")));
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_does_not_block_execution() {
    let backend = MockBackend::new()
        .fail(Endpoint::CurrentUser, network_down())
        .fail(Endpoint::RestRoot, network_down())
        .fail(Endpoint::Health, network_down())
        .script(Endpoint::Preflight, Err(network_down()))
        .script_target(Endpoint::Rpc, "exec_sql", Err(network_down()));
    let system = system(&backend);

    let result = system.run_custom_sql("SELECT 1", None).await;

    assert!(result.is_success(), "{:?}", result.error());
    assert!(result
        .debug_info
        .notes
        .iter()
        .any(|n| n.starts_with("connection check failed")));
}

#[tokio::test(start_paused = true)]
async fn test_missing_audit_table_is_created_first() {
    let backend = MockBackend::new().without_table(LOGS);
    let system = system(&backend);

    let result = system.run_custom_sql("SELECT 1", None).await;

    assert!(result.is_success());
    assert!(backend.has_table(LOGS));
    assert!(result.debug_info.notes.iter().any(|n| n == "created audit table"));
    assert_eq!(backend.rows(LOGS).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_log_store_does_not_change_outcome() {
    let backend = MockBackend::new().fail(Endpoint::Insert, network_down());
    let system = system(&backend);

    let result = system.run_custom_sql("SELECT 1", None).await;

    assert!(result.is_success());
    assert_eq!(backend.calls_to(Endpoint::Insert).len(), 1);
    assert!(backend.rows(LOGS).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_panic_becomes_unexpected_error() {
    let backend = MockBackend::new().fail(Endpoint::InvokeFunction, network_down());
    let system = system_with_direct(&backend, Arc::new(PanickingDirectExecutor));

    let result = system.run_custom_sql("SELECT 1", None).await;

    let error = result.error().unwrap();
    assert_eq!(error.code, ErrorCode::UnexpectedError);
    assert!(error.message.contains("direct executor exploded"));

    let rows = backend.rows(LOGS);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "error");
    assert_eq!(rows[0]["method_used"], "unexpected");
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_between_attempts() {
    let backend = MockBackend::new().fail(Endpoint::InvokeFunction, network_down());
    let system = system_with_direct(&backend, StubDirectExecutor::succeeding());

    let start = tokio::time::Instant::now();
    let result = system.run_custom_sql("SELECT 1", Some(3)).await;

    assert!(result.is_success());
    assert_eq!(backend.calls_to(Endpoint::InvokeFunction).len(), 3);
    // no delay before attempt 0, then 1000ms and 2000ms
    assert_eq!(start.elapsed(), Duration::from_millis(3000));
}
