//! Client-driven SQL execution for hosted Postgres
//!
//! sqlbridge runs ad-hoc SQL and named migrations against a hosted Postgres
//! project over its HTTP surface, with the resilience an admin tool needs
//! when it cannot hold a database connection of its own:
//!
//! - a prioritized chain of execution strategies (edge function first,
//!   direct RPC as fallback) with exponential backoff
//! - self-repair: the server-side `exec_sql` procedure and the
//!   `migration_logs` audit table are created on demand
//! - an audit entry for every terminal outcome
//! - connection diagnostics that never mask an authentication failure
//!
//! # Quick Start
//!
//! ```no_run
//! use sqlbridge_core::MigrationSystem;
//!
//! #[tokio::main]
//! async fn main() -> sqlbridge_core::Result<()> {
//!     // SQLBRIDGE_URL, SQLBRIDGE_ANON_KEY, optionally SQLBRIDGE_ACCESS_TOKEN
//!     let system = MigrationSystem::from_env()?;
//!
//!     let connection = system.check_connection(None).await;
//!     if !connection.success {
//!         eprintln!("backend unreachable: {:?}", connection.error);
//!     }
//!
//!     let result = system.apply_migration("create_module_integrations").await;
//!     println!("{}", serde_json::to_string_pretty(&result).unwrap());
//!     Ok(())
//! }
//! ```
//!
//! # Errors
//!
//! Operations never return `Err` and never panic across the public API.
//! Failures come back inside the result with an
//! [`ErrorCode`](error::ErrorCode) such as `AUTH_ERROR` or `NETWORK_ERROR`,
//! plus a [`DebugTrace`] listing every attempt.

pub mod backend;
pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod direct;
pub mod error;
pub mod executor;
pub mod probe;
pub mod recorder;
pub mod retry;
pub mod sql;
pub mod status;
pub mod system;
pub mod trace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use backend::{Backend, BackendError, RestBackend};
pub use bootstrap::{SchemaBootstrapper, SetupReport, SetupStrategy};
pub use catalog::{MigrationCatalog, MigrationDefinition, MigrationState, MigrationSummary};
pub use config::MigrationConfig;
pub use direct::{DirectExecutor, DirectOutcome, RpcDirectExecutor};
pub use error::{Error, ErrorCode, ErrorType, OperationError, Result};
pub use executor::{SqlExecutor, SqlRequest};
pub use probe::{ConnectionProbeResult, ConnectionProber, ConnectionReport, ProbeStrategy};
pub use recorder::{LogStatus, LogsResult, MigrationLogEntry, MigrationLogRecorder};
pub use retry::{RetryCallback, RetryDecision, RetryError, RetryInfo, RetryPolicy};
pub use status::{StatusCheck, SystemStatus, SystemStatusChecker, SystemStatusReport};
pub use system::{MigrationSystem, MigrationSystemBuilder, TableCheck};
pub use trace::{AttemptRecord, DebugTrace, ExecutionResult};

pub use sqlbridge_client::{BackendClient, SelectQuery};
