//! [`Backend`] over the HTTP client

use async_trait::async_trait;
use serde_json::Value;
use sqlbridge_client::{BackendClient, ClientError, SelectQuery};

use super::{Backend, BackendError};
use crate::error::{Error, Result};

/// Map client errors into the classification the core works with
fn classify_client_error(err: ClientError) -> BackendError {
    match err {
        ClientError::Authentication { status, message } => {
            BackendError::Unauthorized { status, message }
        }
        ClientError::ServiceUnavailable { status, message } => {
            BackendError::Network { status, message }
        }
        ClientError::Network(message) => BackendError::Network { status: 0, message },
        ClientError::Cors(message) => BackendError::Cors(message),
        ClientError::InvalidResponse(message) => BackendError::Parse(message),
        ClientError::Json(e) => BackendError::Parse(format!("JSON error: {}", e)),
        ClientError::Api { status, error } => BackendError::Api {
            status,
            message: error.message,
            code: error.code,
            details: error.details,
        },
        ClientError::Configuration(message) => BackendError::Api {
            status: 0,
            message: format!("Client configuration: {}", message),
            code: None,
            details: None,
        },
        ClientError::Other(message) => BackendError::Network { status: 0, message },
    }
}

/// The production backend: REST, RPC, edge functions and auth over HTTP
///
/// ```no_run
/// use sqlbridge_core::backend::RestBackend;
///
/// // Reads SQLBRIDGE_URL, SQLBRIDGE_ANON_KEY and optionally SQLBRIDGE_ACCESS_TOKEN
/// let backend = RestBackend::from_env()?;
/// # Ok::<(), sqlbridge_core::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: BackendClient,
}

impl RestBackend {
    pub fn new(client: BackendClient) -> Self {
        Self { client }
    }

    pub fn from_env() -> Result<Self> {
        let client = BackendClient::from_env().map_err(|e| Error::Backend(e.to_string()))?;
        Ok(Self::new(client))
    }

    /// The underlying client
    pub fn client(&self) -> &BackendClient {
        &self.client
    }
}

#[async_trait]
impl Backend for RestBackend {
    fn name(&self) -> &str {
        "rest"
    }

    async fn current_user(&self) -> std::result::Result<Value, BackendError> {
        self.client
            .auth()
            .user()
            .await
            .map(|r| r.data)
            .map_err(classify_client_error)
    }

    async fn rest_root(&self) -> std::result::Result<Value, BackendError> {
        self.client
            .rest()
            .root()
            .await
            .map(|r| r.data)
            .map_err(classify_client_error)
    }

    async fn health(&self) -> std::result::Result<Value, BackendError> {
        self.client
            .health()
            .await
            .map(|r| r.data)
            .map_err(classify_client_error)
    }

    async fn preflight_function(&self, name: &str) -> std::result::Result<(), BackendError> {
        self.client
            .functions()
            .preflight(name)
            .await
            .map(|_| ())
            .map_err(classify_client_error)
    }

    async fn invoke_function(
        &self,
        name: &str,
        body: Value,
    ) -> std::result::Result<Value, BackendError> {
        self.client
            .functions()
            .invoke(name, &body)
            .await
            .map(|r| r.data)
            .map_err(classify_client_error)
    }

    async fn rpc(&self, function: &str, args: Value) -> std::result::Result<Value, BackendError> {
        self.client
            .rest()
            .rpc(function, &args)
            .await
            .map(|r| r.data)
            .map_err(classify_client_error)
    }

    async fn select(
        &self,
        table: &str,
        query: SelectQuery,
    ) -> std::result::Result<Value, BackendError> {
        self.client
            .rest()
            .select(table, &query)
            .await
            .map(|r| r.data)
            .map_err(classify_client_error)
    }

    async fn insert(&self, table: &str, row: Value) -> std::result::Result<Value, BackendError> {
        self.client
            .rest()
            .insert(table, &row)
            .await
            .map(|r| r.data)
            .map_err(classify_client_error)
    }

    async fn run_query(&self, sql: &str) -> std::result::Result<Value, BackendError> {
        self.client
            .query(sql)
            .await
            .map(|r| r.data)
            .map_err(classify_client_error)
    }
}
