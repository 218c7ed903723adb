//! Names and budgets shared by every component

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Runtime configuration for a [`MigrationSystem`](crate::MigrationSystem)
///
/// Every field has a default matching a stock project layout, so partial
/// JSON configs deserialize:
///
/// ```
/// use sqlbridge_core::MigrationConfig;
///
/// let config: MigrationConfig = serde_json::from_str(r#"{
///     "sql_function": "run-sql",
///     "retry": { "max_retries": 4 }
/// }"#).unwrap();
///
/// assert_eq!(config.sql_function, "run-sql");
/// assert_eq!(config.retry.max_retries, 4);
/// assert_eq!(config.retry.base_delay_ms, 500);
/// assert_eq!(config.exec_sql_function, "exec_sql");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Backoff schedule and default attempt budget
    pub retry: RetryPolicy,
    /// Attempts per strategy for the connection pre-check inside an execution
    pub preflight_retries: u32,
    /// Edge function that executes SQL
    pub sql_function: String,
    /// Database procedure that executes SQL (`exec_sql(sql_text text)`)
    pub exec_sql_function: String,
    /// Aggregate status procedure
    pub status_function: String,
    /// Audit table
    pub logs_table: String,
    /// Table checked by `check_module_integrations_table`
    pub module_integrations_table: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            preflight_retries: 1,
            sql_function: "execute-sql".to_string(),
            exec_sql_function: "exec_sql".to_string(),
            status_function: "get_migration_system_status".to_string(),
            logs_table: "migration_logs".to_string(),
            module_integrations_table: "module_integrations".to_string(),
        }
    }
}

impl MigrationConfig {
    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the edge function name
    pub fn with_sql_function(mut self, name: impl Into<String>) -> Self {
        self.sql_function = name.into();
        self
    }
}
