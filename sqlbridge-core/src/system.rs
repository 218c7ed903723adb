//! The public entry point
//!
//! [`MigrationSystem`] wires the components together and exposes the
//! operations callers use. Every operation returns a result object; a panic
//! anywhere below is caught here and reported as `UNEXPECTED_ERROR`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use sqlbridge_client::SelectQuery;

use crate::backend::{Backend, RestBackend};
use crate::bootstrap::{SchemaBootstrapper, SetupReport};
use crate::catalog::{MigrationCatalog, MigrationState, MigrationSummary};
use crate::config::MigrationConfig;
use crate::direct::{DirectExecutor, RpcDirectExecutor};
use crate::error::{Error, ErrorCode, OperationError, Result};
use crate::executor::{SqlExecutor, SqlRequest};
use crate::probe::{ConnectionProber, ConnectionReport, ProbeTrace};
use crate::recorder::{operation_type, LogsResult, MigrationLogRecorder};
use crate::retry::{RetryCallback, RetryInfo};
use crate::sql;
use crate::status::{StatusCheck, SystemStatusChecker};
use crate::trace::{DebugTrace, ExecutionResult};

/// Result of [`MigrationSystem::check_module_integrations_table`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableCheck {
    pub success: bool,
    pub exists: bool,
    /// The table was missing and has just been created
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

/// Client-driven SQL execution, bootstrapping and auditing
///
/// ```no_run
/// use sqlbridge_core::MigrationSystem;
///
/// # #[tokio::main]
/// # async fn main() -> sqlbridge_core::Result<()> {
/// let system = MigrationSystem::from_env()?;
///
/// let result = system.run_custom_sql("SELECT 1", None).await;
/// if let Some(error) = result.error() {
///     eprintln!("{} ({})", error.message, error.code);
/// }
/// # Ok(())
/// # }
/// ```
pub struct MigrationSystem {
    config: Arc<MigrationConfig>,
    backend: Arc<dyn Backend>,
    recorder: Arc<MigrationLogRecorder>,
    prober: Arc<ConnectionProber>,
    bootstrapper: Arc<SchemaBootstrapper>,
    executor: SqlExecutor,
    status: SystemStatusChecker,
    catalog: MigrationCatalog,
}

impl MigrationSystem {
    pub fn builder() -> MigrationSystemBuilder {
        MigrationSystemBuilder::default()
    }

    /// A system over [`RestBackend::from_env`] with default configuration
    pub fn from_env() -> Result<Self> {
        Self::builder()
            .backend(Arc::new(RestBackend::from_env()?))
            .build()
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    fn retries(&self, max_retries: Option<u32>) -> u32 {
        max_retries.unwrap_or(self.config.retry.max_retries)
    }

    /// Every audit entry, newest first
    pub async fn get_migration_logs(&self) -> LogsResult {
        guarded(self.recorder.get_migration_logs(), |error| LogsResult {
            success: false,
            data: None,
            error: Some(error),
        })
        .await
    }

    /// Create the audit table through the executor
    pub async fn create_migration_logs_table(&self) -> ExecutionResult {
        let request = SqlRequest::new(
            sql::migration_logs_table(&self.config.logs_table),
            self.config.retry.max_retries,
        )
        .operation_type(operation_type::CREATE_LOGS_TABLE);
        self.executor.execute(request).await
    }

    /// Apply a named migration from the catalog
    pub async fn apply_migration(&self, name: &str) -> ExecutionResult {
        let operation_id = format!("migration_{}", name);
        guarded(
            self.catalog
                .apply(name, &self.executor, self.config.retry.max_retries),
            |error| ExecutionResult::err(error, DebugTrace::new(operation_id)),
        )
        .await
    }

    /// Execute arbitrary SQL
    pub async fn run_custom_sql(&self, sql: &str, max_retries: Option<u32>) -> ExecutionResult {
        self.executor
            .execute_sql(sql, self.retries(max_retries))
            .await
    }

    /// Make sure the module integrations table exists, creating it if needed
    pub async fn check_module_integrations_table(&self) -> TableCheck {
        guarded(self.ensure_module_integrations(), |error| TableCheck {
            success: false,
            exists: false,
            created: false,
            error: Some(error),
        })
        .await
    }

    async fn ensure_module_integrations(&self) -> TableCheck {
        let table = &self.config.module_integrations_table;
        match self
            .backend
            .select(table, SelectQuery::new("id").limit(1))
            .await
        {
            Ok(_) => TableCheck {
                success: true,
                exists: true,
                created: false,
                error: None,
            },
            Err(e) if e.is_missing_relation() => {
                tracing::info!(table = %table, "table missing, creating it");
                let result = self.apply_migration("create_module_integrations").await;
                match result.into_result() {
                    Ok(_) => TableCheck {
                        success: true,
                        exists: true,
                        created: true,
                        error: None,
                    },
                    Err(error) => TableCheck {
                        success: false,
                        exists: false,
                        created: false,
                        error: Some(error),
                    },
                }
            }
            Err(e) => TableCheck {
                success: false,
                exists: false,
                created: false,
                error: Some(OperationError::from(&e)),
            },
        }
    }

    /// Probe connectivity and authentication
    pub async fn check_connection(&self, max_retries: Option<u32>) -> ConnectionReport {
        guarded(
            self.prober.check_connection(self.retries(max_retries)),
            |error| {
                let now = chrono::Utc::now();
                ConnectionReport {
                    success: false,
                    error: Some(error),
                    debug_info: ProbeTrace {
                        started_at: now,
                        finished_at: now,
                        probes: Vec::new(),
                        successful_strategy: None,
                    },
                }
            },
        )
        .await
    }

    /// Install or refresh the exec procedure
    pub async fn setup_exec_sql_function(
        &self,
        max_retries: Option<u32>,
        log_results: bool,
    ) -> SetupReport {
        guarded(
            self.bootstrapper
                .setup_exec_sql_function(self.retries(max_retries), log_results),
            |error| SetupReport {
                success: false,
                error: Some(error),
                debug_info: DebugTrace::new("setup"),
            },
        )
        .await
    }

    /// Which server-side prerequisites are installed
    pub async fn check_migration_system_status(&self) -> StatusCheck {
        guarded(self.status.check(), |error| StatusCheck {
            success: false,
            status: None,
            error: Some(error),
        })
        .await
    }

    /// Applied, pending or drifted, according to the audit log
    pub async fn migration_state(
        &self,
        name: &str,
    ) -> std::result::Result<MigrationState, OperationError> {
        guarded(self.catalog.state(name, &self.recorder), Err).await
    }

    pub fn list_migrations(&self) -> Vec<MigrationSummary> {
        self.catalog.list()
    }
}

/// Await `fut`, turning a panic into `on_panic(UNEXPECTED_ERROR)`
async fn guarded<T, F>(fut: F, on_panic: impl FnOnce(OperationError) -> T) -> T
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => value,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(error = %message, "operation panicked");
            on_panic(OperationError::new(
                ErrorCode::UnexpectedError,
                format!("Unexpected error: {}", message),
            ))
        }
    }
}

/// Builder for [`MigrationSystem`]
#[derive(Default)]
pub struct MigrationSystemBuilder {
    backend: Option<Arc<dyn Backend>>,
    config: Option<MigrationConfig>,
    direct: Option<Arc<dyn DirectExecutor>>,
    catalog: Option<MigrationCatalog>,
    on_retry: Option<RetryCallback>,
}

impl MigrationSystemBuilder {
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(mut self, config: MigrationConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the default RPC fallback
    pub fn direct_executor(mut self, direct: Arc<dyn DirectExecutor>) -> Self {
        self.direct = Some(direct);
        self
    }

    /// Replace the built-in catalog
    pub fn catalog(mut self, catalog: MigrationCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Observe every backoff, from any component
    ///
    /// ```
    /// use std::sync::Arc;
    /// use sqlbridge_core::{BackendClient, MigrationSystem, RestBackend};
    ///
    /// let client = BackendClient::builder()
    ///     .base_url("https://project.example.co")
    ///     .api_key("anon-key")
    ///     .build()
    ///     .unwrap();
    /// let system = MigrationSystem::builder()
    ///     .backend(Arc::new(RestBackend::new(client)))
    ///     .with_retry_callback(|info| {
    ///         eprintln!("retry {} in {:?}: {}", info.attempt, info.delay, info.error);
    ///     })
    ///     .build()
    ///     .unwrap();
    /// # let _ = system;
    /// ```
    pub fn with_retry_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(RetryInfo) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<MigrationSystem> {
        let backend = self
            .backend
            .ok_or_else(|| Error::Config("no backend configured".to_string()))?;
        let config = Arc::new(self.config.unwrap_or_default());
        if config.sql_function.is_empty() || config.exec_sql_function.is_empty() {
            return Err(Error::Config(
                "function names must not be empty".to_string(),
            ));
        }

        let on_retry = self.on_retry;
        let direct = self.direct.unwrap_or_else(|| {
            let rpc = RpcDirectExecutor::new(
                backend.clone(),
                config.exec_sql_function.clone(),
                config.retry.clone(),
            );
            Arc::new(with_callback(rpc, &on_retry, RpcDirectExecutor::with_retry_callback))
        });
        let catalog = self
            .catalog
            .unwrap_or_else(|| MigrationCatalog::builtin(&config));

        let recorder = Arc::new(MigrationLogRecorder::new(
            backend.clone(),
            config.logs_table.clone(),
        ));
        let prober = Arc::new(with_callback(
            ConnectionProber::new(backend.clone(), config.clone()),
            &on_retry,
            ConnectionProber::with_retry_callback,
        ));
        let bootstrapper = Arc::new(with_callback(
            SchemaBootstrapper::new(
                backend.clone(),
                config.clone(),
                recorder.clone(),
                direct.clone(),
            ),
            &on_retry,
            SchemaBootstrapper::with_retry_callback,
        ));
        let executor = with_callback(
            SqlExecutor::new(
                backend.clone(),
                config.clone(),
                prober.clone(),
                recorder.clone(),
                bootstrapper.clone(),
                direct,
            ),
            &on_retry,
            SqlExecutor::with_retry_callback,
        );
        let status = SystemStatusChecker::new(backend.clone(), config.clone(), recorder.clone());

        Ok(MigrationSystem {
            config,
            backend,
            recorder,
            prober,
            bootstrapper,
            executor,
            status,
            catalog,
        })
    }
}

fn with_callback<T>(
    component: T,
    on_retry: &Option<RetryCallback>,
    attach: fn(T, RetryCallback) -> T,
) -> T {
    match on_retry {
        Some(callback) => attach(component, callback.clone()),
        None => component,
    }
}
