//! Common test utilities shared across test files.
//!
//! Items here may not be used by all test files, hence the module-level allow.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlbridge_core::test_utils::MockBackend;
use sqlbridge_core::{
    DirectExecutor, DirectOutcome, ErrorCode, MigrationConfig, MigrationSystem, OperationError,
    RetryPolicy,
};

pub const LOGS: &str = "migration_logs";

/// Default configuration with millisecond backoff, for tests on real time
pub fn fast_config() -> MigrationConfig {
    MigrationConfig::default().with_retry(RetryPolicy {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
    })
}

/// Route `tracing` output through the test harness; `RUST_LOG` filters it
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn system(backend: &MockBackend) -> MigrationSystem {
    init_tracing();
    MigrationSystem::builder()
        .backend(Arc::new(backend.clone()))
        .build()
        .expect("system should build")
}

pub fn system_with_direct(
    backend: &MockBackend,
    direct: Arc<dyn DirectExecutor>,
) -> MigrationSystem {
    init_tracing();
    MigrationSystem::builder()
        .backend(Arc::new(backend.clone()))
        .direct_executor(direct)
        .build()
        .expect("system should build")
}

/// Audit rows with the given `operation_type`
pub fn logs_of_type(backend: &MockBackend, operation_type: &str) -> Vec<Value> {
    backend
        .rows(LOGS)
        .into_iter()
        .filter(|row| row["operation_type"] == operation_type)
        .collect()
}

// ===== Direct Executors =====

/// Returns a fixed outcome and counts calls
pub struct StubDirectExecutor {
    result: Result<Value, OperationError>,
    calls: AtomicUsize,
}

impl StubDirectExecutor {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            result: Ok(json!({ "via": "stub" })),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            result: Err(OperationError::new(
                ErrorCode::SqlError,
                "direct execution failed",
            )),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectExecutor for StubDirectExecutor {
    async fn execute(&self, _sql: &str, _operation_id: &str) -> DirectOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        DirectOutcome {
            method: "stub-direct".to_string(),
            result: self.result.clone(),
            attempts: Vec::new(),
        }
    }
}

/// Panics on every call
pub struct PanickingDirectExecutor;

#[async_trait]
impl DirectExecutor for PanickingDirectExecutor {
    async fn execute(&self, _sql: &str, _operation_id: &str) -> DirectOutcome {
        panic!("direct executor exploded");
    }
}
