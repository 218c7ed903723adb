//! System status checker

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::backend::{Backend, BackendError};
use crate::config::MigrationConfig;
use crate::error::OperationError;
use crate::recorder::MigrationLogRecorder;
use crate::sql::NOOP_SQL;

pub const EXEC_SQL_FUNCTION: &str = "exec_sql_function";
pub const MIGRATION_LOGS_TABLE: &str = "migration_logs_table";
pub const STATUS_FUNCTION: &str = "status_function";
pub const SQL_EDGE_FUNCTION: &str = "sql_edge_function";

/// Components without which the system cannot run migrations
const REQUIRED: [&str; 2] = [EXEC_SQL_FUNCTION, MIGRATION_LOGS_TABLE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Complete,
    Incomplete,
}

/// How the report was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    /// The aggregate status procedure
    Remote,
    /// Individual probes
    Manual,
}

/// Snapshot of the server-side prerequisites
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatusReport {
    pub status: SystemStatus,
    /// `None` when a component could not be checked
    pub components: BTreeMap<String, Option<bool>>,
    pub missing_components: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub source: StatusSource,
}

impl SystemStatusReport {
    pub fn from_components(components: BTreeMap<String, Option<bool>>, source: StatusSource) -> Self {
        let missing_components: Vec<String> = components
            .iter()
            .filter(|(_, present)| **present == Some(false))
            .map(|(name, _)| name.clone())
            .collect();
        let complete = missing_components.is_empty()
            && REQUIRED
                .iter()
                .all(|name| components.get(*name) == Some(&Some(true)));

        Self {
            status: if complete {
                SystemStatus::Complete
            } else {
                SystemStatus::Incomplete
            },
            components,
            missing_components,
            timestamp: Utc::now(),
            source,
        }
    }

    /// Parse the aggregate procedure's payload
    ///
    /// Accepts either a flat `{component: bool|null}` object or one nested
    /// under `components`.
    fn from_remote(value: &Value) -> Option<Self> {
        let object = value
            .get("components")
            .unwrap_or(value)
            .as_object()?;

        let mut components = BTreeMap::new();
        for (name, present) in object {
            let present = match present {
                Value::Bool(b) => Some(*b),
                Value::Null => None,
                _ => continue,
            };
            components.insert(name.clone(), present);
        }

        if components.is_empty() {
            return None;
        }
        Some(Self::from_components(components, StatusSource::Remote))
    }
}

/// Result of [`SystemStatusChecker::check`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCheck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SystemStatusReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

pub struct SystemStatusChecker {
    backend: Arc<dyn Backend>,
    config: Arc<MigrationConfig>,
    recorder: Arc<MigrationLogRecorder>,
}

impl SystemStatusChecker {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: Arc<MigrationConfig>,
        recorder: Arc<MigrationLogRecorder>,
    ) -> Self {
        Self {
            backend,
            config,
            recorder,
        }
    }

    pub async fn check(&self) -> StatusCheck {
        let remote = self
            .backend
            .rpc(&self.config.status_function, json!({}))
            .await;

        let status_function = match &remote {
            Ok(value) => match SystemStatusReport::from_remote(value) {
                Some(report) => {
                    return StatusCheck {
                        success: true,
                        status: Some(report),
                        error: None,
                    }
                }
                None => {
                    tracing::warn!("status function returned an unrecognized payload");
                    Some(true)
                }
            },
            Err(e) if e.is_missing_function(&self.config.status_function) => Some(false),
            Err(e) => {
                tracing::debug!(error = %e, "status function unavailable, probing manually");
                None
            }
        };

        let exec_sql = self
            .backend
            .rpc(
                &self.config.exec_sql_function,
                json!({ "sql_text": NOOP_SQL }),
            )
            .await;
        let exec_sql_present = match &exec_sql {
            Ok(_) => Some(true),
            Err(e) if e.is_missing_function(&self.config.exec_sql_function) => Some(false),
            Err(_) => None,
        };

        let logs_table = self.recorder.table_exists().await;
        let logs_present = logs_table.as_ref().ok().copied();

        if exec_sql_present.is_none() && logs_present.is_none() {
            let error = first_error([exec_sql.err(), logs_table.err(), remote.err()]);
            return StatusCheck {
                success: false,
                status: None,
                error: Some(error),
            };
        }

        let components = BTreeMap::from([
            (EXEC_SQL_FUNCTION.to_string(), exec_sql_present),
            (MIGRATION_LOGS_TABLE.to_string(), logs_present),
            (STATUS_FUNCTION.to_string(), status_function),
            (SQL_EDGE_FUNCTION.to_string(), None),
        ]);

        StatusCheck {
            success: true,
            status: Some(SystemStatusReport::from_components(
                components,
                StatusSource::Manual,
            )),
            error: None,
        }
    }
}

/// Prefer an auth failure, otherwise the first error seen
fn first_error<const N: usize>(errors: [Option<BackendError>; N]) -> OperationError {
    let errors: Vec<BackendError> = errors.into_iter().flatten().collect();
    let chosen = errors
        .iter()
        .find(|e| e.is_auth())
        .or_else(|| errors.first());
    match chosen {
        Some(e) => OperationError::from(e),
        None => OperationError::new(
            crate::error::ErrorCode::ConnectionError,
            "System status could not be determined",
        ),
    }
}
