//! Named migrations
//!
//! A fixed, versioned registry of idempotent SQL payloads. Each definition
//! carries a SHA-256 checksum of its SQL, recorded in the audit log when it
//! is applied, so later reads can tell applied, pending and drifted apart.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlbridge_client::SelectQuery;
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::error::{ErrorCode, OperationError};
use crate::executor::{SqlExecutor, SqlRequest};
use crate::recorder::{operation_type, LogStatus, MigrationLogRecorder};
use crate::sql;
use crate::trace::{DebugTrace, ExecutionResult};

/// Computes SHA256 checksum of SQL content
pub fn compute_checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex::encode(hasher.finalize())
}

/// A named SQL payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDefinition {
    pub name: String,
    pub version: String,
    pub description: String,
    pub sql: String,
}

impl MigrationDefinition {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            sql: sql.into(),
        }
    }

    pub fn checksum(&self) -> String {
        compute_checksum(&self.sql)
    }
}

/// Listing entry for a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    pub name: String,
    pub version: String,
    pub description: String,
    pub checksum: String,
}

/// Where a migration stands according to the audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum MigrationState {
    /// No successful application recorded
    Pending,
    /// Applied with the current SQL
    Applied {
        at: Option<DateTime<Utc>>,
        checksum: String,
    },
    /// Applied, but the SQL has changed since
    Drifted {
        at: Option<DateTime<Utc>>,
        applied_checksum: String,
        current_checksum: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct MigrationCatalog {
    definitions: Vec<MigrationDefinition>,
}

impl MigrationCatalog {
    pub fn new(definitions: Vec<MigrationDefinition>) -> Self {
        Self { definitions }
    }

    /// The built-in migrations, named after `config`
    pub fn builtin(config: &MigrationConfig) -> Self {
        Self::new(vec![
            MigrationDefinition::new(
                "create_migration_logs",
                "001",
                "Audit table for SQL executions",
                sql::migration_logs_table(&config.logs_table),
            ),
            MigrationDefinition::new(
                "create_exec_sql_function",
                "002",
                "Server-side SQL execution procedure",
                sql::exec_sql_function(&config.exec_sql_function),
            ),
            MigrationDefinition::new(
                "create_system_status_function",
                "003",
                "Aggregate status procedure",
                sql::system_status_function(
                    &config.status_function,
                    &config.exec_sql_function,
                    &config.logs_table,
                ),
            ),
            MigrationDefinition::new(
                "create_module_integrations",
                "004",
                "Module integrations registry",
                sql::module_integrations_table(&config.module_integrations_table),
            ),
            MigrationDefinition::new(
                "add_module_integration_settings",
                "005",
                "Settings column on module integrations",
                sql::module_integration_settings(&config.module_integrations_table),
            ),
        ])
    }

    /// Add or replace a definition
    pub fn register(&mut self, definition: MigrationDefinition) {
        match self
            .definitions
            .iter_mut()
            .find(|d| d.name == definition.name)
        {
            Some(existing) => *existing = definition,
            None => self.definitions.push(definition),
        }
    }

    pub fn get(&self, name: &str) -> Option<&MigrationDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn list(&self) -> Vec<MigrationSummary> {
        self.definitions
            .iter()
            .map(|d| MigrationSummary {
                name: d.name.clone(),
                version: d.version.clone(),
                description: d.description.clone(),
                checksum: d.checksum(),
            })
            .collect()
    }

    fn lookup(&self, name: &str) -> Result<&MigrationDefinition, OperationError> {
        self.get(name).ok_or_else(|| {
            OperationError::new(
                ErrorCode::UnknownMigration,
                format!("Unknown migration: {}", name),
            )
        })
    }

    /// Execute a named migration; unknown names fail without touching the network
    pub async fn apply(
        &self,
        name: &str,
        executor: &SqlExecutor,
        max_retries: u32,
    ) -> ExecutionResult {
        let definition = match self.lookup(name) {
            Ok(definition) => definition,
            Err(error) => {
                let mut trace = DebugTrace::new(format!("migration_{}", name));
                trace.finish("catalog");
                return ExecutionResult::err(error, trace);
            }
        };

        tracing::info!(
            migration = %definition.name,
            version = %definition.version,
            "applying migration"
        );

        let request = SqlRequest::new(definition.sql.as_str(), max_retries)
            .operation_id(format!("migration_{}_{}", definition.name, Uuid::new_v4()))
            .operation_type(operation_type::APPLY_MIGRATION)
            .details(json!({
                "migration": definition.name,
                "version": definition.version,
                "checksum": definition.checksum(),
            }));
        executor.execute(request).await
    }

    /// Compare the latest successful application against the current SQL
    pub async fn state(
        &self,
        name: &str,
        recorder: &MigrationLogRecorder,
    ) -> Result<MigrationState, OperationError> {
        let definition = self.lookup(name)?;

        let query = SelectQuery::default()
            .eq("operation_type", operation_type::APPLY_MIGRATION)
            .eq("status", "success")
            .order_desc("created_at");
        let entries = match recorder.find(query).await {
            Ok(entries) => entries,
            Err(e) if e.is_missing_relation() => return Ok(MigrationState::Pending),
            Err(e) => return Err(OperationError::from(&e)),
        };

        let latest = entries.into_iter().find(|entry| {
            entry.status == LogStatus::Success
                && entry.details.get("migration").and_then(|v| v.as_str()) == Some(name)
        });

        let Some(entry) = latest else {
            return Ok(MigrationState::Pending);
        };

        let current = definition.checksum();
        let applied = entry
            .details
            .get("checksum")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if applied == current {
            Ok(MigrationState::Applied {
                at: entry.created_at,
                checksum: current,
            })
        } else {
            Ok(MigrationState::Drifted {
                at: entry.created_at,
                applied_checksum: applied,
                current_checksum: current,
            })
        }
    }
}
