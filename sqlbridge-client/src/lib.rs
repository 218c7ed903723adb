//! Minimal client for hosted Postgres backends
//!
//! This crate provides a lightweight client for the HTTP surface of a hosted
//! Postgres project: the REST layer, RPC procedures, edge functions, the auth
//! session endpoint and the meta query endpoint.
//!
//! # Quick Start
//!
//! ```no_run
//! // Requires SQLBRIDGE_URL and SQLBRIDGE_ANON_KEY environment variables
//! use sqlbridge_client::BackendClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = BackendClient::from_env()?;
//!
//! let response = client
//!     .rest()
//!     .rpc("exec_sql", &serde_json::json!({ "sql_text": "SELECT 1" }))
//!     .await?;
//! println!("{:?}", response.data);
//! # Ok(())
//! # }
//! ```
//!
//! # Errors
//!
//! Every call returns [`ClientError`], which keeps the HTTP status of the
//! failed response (`0` when the request never got one) so callers can tell
//! authentication failures from transport failures from SQL errors:
//!
//! ```no_run
//! use sqlbridge_client::{BackendClient, ClientError};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = BackendClient::new("https://project.example.co", "anon-key")?;
//!
//! match client.auth().user().await {
//!     Ok(user) => println!("signed in: {}", user.data["email"]),
//!     Err(e) if e.is_auth() => println!("session expired"),
//!     Err(e) if e.is_retryable() => println!("backend unreachable: {}", e),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The client never retries. Retry policy lives in `sqlbridge-core`.

mod client;
mod error;
mod query;

pub use client::{
    Auth, BackendClient, BackendClientBuilder, Functions, RawResponse, Response, Rest,
};
pub use error::{ApiError, ClientError};
pub use query::SelectQuery;
