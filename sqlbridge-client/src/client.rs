//! Hosted Postgres backend client

use crate::error::ClientError;
use crate::query::SelectQuery;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default health endpoint, relative to the base URL
const DEFAULT_HEALTH_PATH: &str = "/auth/v1/health";

/// Default meta query endpoint, relative to the base URL
const DEFAULT_QUERY_PATH: &str = "/pg/query";

/// Origin sent with CORS preflight requests
const DEFAULT_ORIGIN: &str = "http://localhost";

/// Headers a browser would ask permission for when invoking a function
const PREFLIGHT_REQUEST_HEADERS: &str = "authorization, x-client-info, apikey, content-type";

// ============================================================================
// Raw Response Types
// ============================================================================

/// Raw HTTP response metadata
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code
    pub status: u16,

    /// Canonical reason phrase for the status
    pub status_text: String,

    /// Response headers
    pub headers: HashMap<String, String>,

    /// Request ID (from `x-request-id` or `sb-request-id`)
    pub request_id: Option<String>,
}

impl RawResponse {
    fn from_response(response: &reqwest::Response) -> Self {
        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();

        let request_id = headers
            .get("x-request-id")
            .or_else(|| headers.get("sb-request-id"))
            .cloned();

        Self {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            request_id,
        }
    }

    /// Get a specific header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }
}

/// A response with both parsed data and raw HTTP metadata
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The parsed response body (`Value::Null` for empty bodies)
    pub data: T,

    /// Raw HTTP response metadata
    pub raw: RawResponse,
}

impl<T> Response<T> {
    /// Get the parsed data
    pub fn into_data(self) -> T {
        self.data
    }

    /// Get the request ID for debugging
    pub fn request_id(&self) -> Option<&str> {
        self.raw.request_id.as_deref()
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client for a hosted Postgres backend
///
/// Talks to the REST layer (`/rest/v1`), RPC procedures (`/rest/v1/rpc`),
/// edge functions (`/functions/v1`), the auth service (`/auth/v1`) and the
/// meta query endpoint. Every call is a single request; retry policy lives
/// with the caller.
#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    health_path: String,
    query_path: String,
    origin: String,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("health_path", &self.health_path)
            .field("query_path", &self.query_path)
            .finish()
    }
}

impl BackendClient {
    /// Create a new client for a project URL and API key
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ClientError> {
        Self::builder().base_url(base_url).api_key(api_key).build()
    }

    /// Create a client from the environment
    ///
    /// Reads `SQLBRIDGE_URL`, `SQLBRIDGE_ANON_KEY` and, if present,
    /// `SQLBRIDGE_ACCESS_TOKEN` (the signed-in user's session token).
    pub fn from_env() -> Result<Self, ClientError> {
        let base_url = std::env::var("SQLBRIDGE_URL").map_err(|_| {
            ClientError::Configuration("SQLBRIDGE_URL environment variable not set".to_string())
        })?;
        let api_key = std::env::var("SQLBRIDGE_ANON_KEY").map_err(|_| {
            ClientError::Configuration(
                "SQLBRIDGE_ANON_KEY environment variable not set".to_string(),
            )
        })?;

        let mut builder = Self::builder().base_url(base_url).api_key(api_key);
        if let Ok(token) = std::env::var("SQLBRIDGE_ACCESS_TOKEN") {
            builder = builder.access_token(token);
        }
        builder.build()
    }

    /// Create a builder for more advanced configuration
    pub fn builder() -> BackendClientBuilder {
        BackendClientBuilder::new()
    }

    /// The project base URL (no trailing slash)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Return a copy of this client authenticated with a user session token
    pub fn with_access_token(&self, token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            ..self.clone()
        }
    }

    /// Get a handle to the REST API (tables and RPC)
    pub fn rest(&self) -> Rest<'_> {
        Rest { client: self }
    }

    /// Get a handle to edge functions
    pub fn functions(&self) -> Functions<'_> {
        Functions { client: self }
    }

    /// Get a handle to the auth service
    pub fn auth(&self) -> Auth<'_> {
        Auth { client: self }
    }

    /// Probe the health endpoint
    pub async fn health(&self) -> Result<Response<Value>, ClientError> {
        let url = format!("{}{}", self.base_url, self.health_path);
        self.execute::<()>(reqwest::Method::GET, &url, None, &[]).await
    }

    /// Run raw SQL through the meta query endpoint
    pub async fn query(&self, sql: &str) -> Result<Response<Value>, ClientError> {
        let url = format!("{}{}", self.base_url, self.query_path);
        let body = serde_json::json!({ "query": sql });
        self.execute(reqwest::Method::POST, &url, Some(&body), &[])
            .await
    }

    fn headers(&self) -> Result<HeaderMap, ClientError> {
        build_headers(&self.api_key, self.access_token.as_deref())
    }

    /// Send a single request and parse the body as JSON
    async fn execute<B>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&B>,
        query: &[(String, String)],
    ) -> Result<Response<Value>, ClientError>
    where
        B: serde::Serialize,
    {
        let mut request = self
            .client
            .request(method.clone(), url)
            .headers(self.headers()?);

        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(b) = body {
            request = request.json(b);
        }

        tracing::trace!(%method, url, "sending backend request");

        let response = request
            .send()
            .await
            .map_err(ClientError::from_reqwest_error)?;
        let raw = RawResponse::from_response(&response);
        let text = response
            .text()
            .await
            .map_err(ClientError::from_reqwest_error)?;

        if !(200..300).contains(&raw.status) {
            return Err(ClientError::from_response(raw.status, &text));
        }

        let data = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                ClientError::InvalidResponse(format!("Failed to parse response: {}", e))
            })?
        };

        Ok(Response { data, raw })
    }
}

/// Builder for backend client configuration
///
/// Create with [`BackendClient::builder()`]. `base_url` and `api_key` are
/// required.
pub struct BackendClientBuilder {
    base_url: Option<String>,
    api_key: Option<String>,
    access_token: Option<String>,
    timeout: Option<Duration>,
    health_path: Option<String>,
    query_path: Option<String>,
    origin: Option<String>,
}

impl BackendClientBuilder {
    fn new() -> Self {
        Self {
            base_url: None,
            api_key: None,
            access_token: None,
            timeout: None,
            health_path: None,
            query_path: None,
            origin: None,
        }
    }

    /// Set the project base URL
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the project API key (sent as `apikey`)
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the user session token (sent as the bearer token)
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the health endpoint path
    pub fn health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = Some(path.into());
        self
    }

    /// Override the meta query endpoint path
    pub fn query_path(mut self, path: impl Into<String>) -> Self {
        self.query_path = Some(path.into());
        self
    }

    /// Override the `Origin` sent with CORS preflights
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Build the client
    pub fn build(self) -> Result<BackendClient, ClientError> {
        let base_url = self
            .base_url
            .ok_or_else(|| ClientError::Configuration("Base URL is required".to_string()))?;
        let api_key = self
            .api_key
            .ok_or_else(|| ClientError::Configuration("API key is required".to_string()))?;

        // Fail on a bad key now rather than on every request
        build_headers(&api_key, self.access_token.as_deref())?;

        let client = reqwest::Client::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| {
                ClientError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(BackendClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            access_token: self.access_token,
            health_path: self
                .health_path
                .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string()),
            query_path: self
                .query_path
                .unwrap_or_else(|| DEFAULT_QUERY_PATH.to_string()),
            origin: self.origin.unwrap_or_else(|| DEFAULT_ORIGIN.to_string()),
        })
    }
}

// ============================================================================
// REST API
// ============================================================================

/// REST API handle (tables and RPC procedures)
pub struct Rest<'a> {
    client: &'a BackendClient,
}

impl<'a> Rest<'a> {
    /// `GET /rest/v1/` - the OpenAPI root, used as a reachability probe
    pub async fn root(&self) -> Result<Response<Value>, ClientError> {
        let url = format!("{}/rest/v1/", self.client.base_url);
        self.client
            .execute::<()>(reqwest::Method::GET, &url, None, &[])
            .await
    }

    /// Call a remote procedure: `POST /rest/v1/rpc/<function>`
    pub async fn rpc(&self, function: &str, args: &Value) -> Result<Response<Value>, ClientError> {
        let url = format!("{}/rest/v1/rpc/{}", self.client.base_url, function);
        self.client
            .execute(reqwest::Method::POST, &url, Some(args), &[])
            .await
    }

    /// Read rows from a table
    pub async fn select(
        &self,
        table: &str,
        query: &SelectQuery,
    ) -> Result<Response<Value>, ClientError> {
        let url = format!("{}/rest/v1/{}", self.client.base_url, table);
        self.client
            .execute::<()>(reqwest::Method::GET, &url, None, &query.to_pairs())
            .await
    }

    /// Insert a row into a table
    pub async fn insert(&self, table: &str, row: &Value) -> Result<Response<Value>, ClientError> {
        let url = format!("{}/rest/v1/{}", self.client.base_url, table);
        self.client
            .execute(reqwest::Method::POST, &url, Some(row), &[])
            .await
    }
}

// ============================================================================
// Edge Functions
// ============================================================================

/// Edge functions handle
pub struct Functions<'a> {
    client: &'a BackendClient,
}

impl<'a> Functions<'a> {
    /// Invoke a function: `POST /functions/v1/<name>`
    pub async fn invoke(&self, name: &str, body: &Value) -> Result<Response<Value>, ClientError> {
        let url = format!("{}/functions/v1/{}", self.client.base_url, name);
        self.client
            .execute(reqwest::Method::POST, &url, Some(body), &[])
            .await
    }

    /// Send the CORS preflight a browser would send before [`Self::invoke`]
    ///
    /// Any failure other than 401/403 is reported as [`ClientError::Cors`].
    pub async fn preflight(&self, name: &str) -> Result<RawResponse, ClientError> {
        let url = format!("{}/functions/v1/{}", self.client.base_url, name);
        let origin = HeaderValue::from_str(&self.client.origin)
            .map_err(|e| ClientError::Configuration(format!("Invalid origin: {}", e)))?;

        let response = self
            .client
            .client
            .request(reqwest::Method::OPTIONS, &url)
            .header("origin", origin)
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", PREFLIGHT_REQUEST_HEADERS)
            .send()
            .await
            .map_err(|e| ClientError::Cors(e.to_string()))?;

        let raw = RawResponse::from_response(&response);
        match raw.status {
            200..=299 => Ok(raw),
            401 | 403 => Err(ClientError::Authentication {
                status: raw.status,
                message: format!("Preflight rejected: HTTP {}", raw.status),
            }),
            status => Err(ClientError::Cors(format!(
                "Preflight returned HTTP {} {}",
                status, raw.status_text
            ))),
        }
    }
}

// ============================================================================
// Auth
// ============================================================================

/// Auth service handle
pub struct Auth<'a> {
    client: &'a BackendClient,
}

impl<'a> Auth<'a> {
    /// `GET /auth/v1/user` - resolves the current session's user
    pub async fn user(&self) -> Result<Response<Value>, ClientError> {
        let url = format!("{}/auth/v1/user", self.client.base_url);
        self.client
            .execute::<()>(reqwest::Method::GET, &url, None, &[])
            .await
    }
}

// ============================================================================
// Shared Helpers
// ============================================================================

fn build_headers(api_key: &str, access_token: Option<&str>) -> Result<HeaderMap, ClientError> {
    let mut headers = HeaderMap::new();

    headers.insert(
        "apikey",
        HeaderValue::from_str(api_key)
            .map_err(|e| ClientError::Configuration(format!("Invalid API key: {}", e)))?,
    );

    let bearer = format!("Bearer {}", access_token.unwrap_or(api_key));
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&bearer)
            .map_err(|e| ClientError::Configuration(format!("Invalid access token: {}", e)))?,
    );

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    Ok(headers)
}
