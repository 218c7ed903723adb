//! Error types for the backend client

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// API Error Types
// ============================================================================

/// Error body returned by the REST/RPC layer
///
/// PostgREST reports failures as `{code, message, details, hint}`. Edge
/// functions are looser, so every field except `message` is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiError {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

/// Edge function style error wrapper: `{"error": "..."}` or `{"error": {...}}`
#[derive(Debug, Deserialize)]
struct WrappedError {
    error: WrappedErrorBody,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WrappedErrorBody {
    Text(String),
    Detailed(ApiError),
}

// ============================================================================
// Client Error Types
// ============================================================================

/// Errors that can occur when talking to the backend
#[derive(Debug, Error)]
pub enum ClientError {
    /// Authentication or authorization failed (401/403)
    #[error("Authentication failed ({status}): {message}")]
    Authentication { status: u16, message: String },

    /// The backend answered with a non-success status and an error body
    #[error("API error ({status}): {}", .error.message)]
    Api { status: u16, error: ApiError },

    /// Server-side failure (5xx, including edge proxy 520s)
    #[error("Service unavailable ({status}): {message}")]
    ServiceUnavailable { status: u16, message: String },

    /// CORS preflight was rejected or could not be sent
    #[error("CORS preflight failed: {0}")]
    Cors(String),

    /// Transport failure before any HTTP status was received
    #[error("Network error: {0}")]
    Network(String),

    /// Response body could not be parsed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// JSON serialization error on the request side
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (missing URL or API key, bad header value)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// HTTP status associated with this error, or 0 when no response arrived
    pub fn status(&self) -> u16 {
        match self {
            ClientError::Authentication { status, .. }
            | ClientError::Api { status, .. }
            | ClientError::ServiceUnavailable { status, .. } => *status,
            _ => 0,
        }
    }

    /// Returns true for 401/403 failures
    pub fn is_auth(&self) -> bool {
        matches!(self, ClientError::Authentication { .. })
    }

    /// Returns true if this error is transient
    ///
    /// Transport failures, 5xx responses and unparseable bodies are worth
    /// retrying. Authentication and API errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ServiceUnavailable { .. }
                | ClientError::Network(_)
                | ClientError::InvalidResponse(_)
        )
    }

    /// Classify a non-success response into an error variant
    pub fn from_response(status: u16, body: &str) -> Self {
        let error = parse_error_body(body).unwrap_or_else(|| ApiError {
            message: if body.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                body.to_string()
            },
            ..Default::default()
        });

        match status {
            401 | 403 => ClientError::Authentication {
                status,
                message: error.message,
            },
            500..=599 => ClientError::ServiceUnavailable {
                status,
                message: error.message,
            },
            _ => ClientError::Api { status, error },
        }
    }

    /// Classify a reqwest error into an error variant
    pub fn from_reqwest_error(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Network(format!("Request timed out: {}", err))
        } else if err.is_connect() {
            ClientError::Network(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            ClientError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            ClientError::from_response(status.as_u16(), &err.to_string())
        } else if err.is_request() {
            ClientError::Network(format!("Request failed: {}", err))
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

/// Parse either a PostgREST error body or an `{"error": ...}` wrapper
pub(crate) fn parse_error_body(body: &str) -> Option<ApiError> {
    if let Ok(error) = serde_json::from_str::<ApiError>(body) {
        return Some(error);
    }
    match serde_json::from_str::<WrappedError>(body).ok()?.error {
        WrappedErrorBody::Text(message) => Some(ApiError {
            message,
            ..Default::default()
        }),
        WrappedErrorBody::Detailed(error) => Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_response_postgrest_body() {
        let body = r#"{"code":"42883","details":null,"hint":null,"message":"function exec_sql(text) does not exist"}"#;
        let err = ClientError::from_response(404, body);
        match err {
            ClientError::Api { status, error } => {
                assert_eq!(status, 404);
                assert_eq!(error.code.as_deref(), Some("42883"));
                assert!(error.message.contains("does not exist"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_from_response_wrapped_error() {
        let err = ClientError::from_response(400, r#"{"error":"syntax error at or near \"SELEC\""}"#);
        assert!(matches!(err, ClientError::Api { .. }));
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn test_from_response_auth() {
        assert!(ClientError::from_response(401, "").is_auth());
        assert!(ClientError::from_response(403, r#"{"message":"JWT expired"}"#).is_auth());
    }

    #[test]
    fn test_from_response_server_error_is_retryable() {
        let err = ClientError::from_response(520, "");
        assert_eq!(err.status(), 520);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("HTTP 520"));
    }

    #[test]
    fn test_status_is_zero_without_response() {
        assert_eq!(ClientError::Network("refused".into()).status(), 0);
        assert_eq!(ClientError::Cors("blocked".into()).status(), 0);
    }

    #[test]
    fn test_is_not_retryable() {
        assert!(!ClientError::from_response(401, "").is_retryable());
        assert!(!ClientError::from_response(400, "bad").is_retryable());
        assert!(!ClientError::Configuration("missing url".into()).is_retryable());
        assert!(!ClientError::Cors("blocked".into()).is_retryable());
    }

    #[test]
    fn test_parse_error_body_plain_text() {
        assert!(parse_error_body("upstream connect error").is_none());
    }
}
