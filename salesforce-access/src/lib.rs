//! Resilient access layer for the Salesforce REST and Streaming APIs.
//!
//! The crate is built from three cooperating pieces:
//! - [`session::SessionManager`] acquires, refreshes and revokes OAuth2 password-grant
//!   sessions, collapsing concurrent refreshes into a single round trip.
//! - [`api::Client`] executes REST calls, transparently re-authenticating and replaying a
//!   request once when the session has expired, and decoding provider error payloads.
//! - [`streaming::Engine`] drives a long-polling Bayeux push client, provisions push topics
//!   and dispatches inbound notifications to registered consumers.
//!
//! # Examples
//!
//! ```no_run
//! use salesforce_access::session::{self, Credentials};
//! use salesforce_access::api::{self, RequestSpec};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Arc::new(
//!     session::Builder::new()
//!         .credentials(Credentials {
//!             login_url: "https://login.salesforce.com".to_string(),
//!             client_id: "...".to_string(),
//!             client_secret: "...".to_string(),
//!             username: "user@example.com".to_string(),
//!             password: "...".to_string(),
//!         })
//!         .build()?,
//! );
//!
//! let client = api::Client::new(session.clone(), api::Config::default()).await?;
//! let body = client
//!     .execute(RequestSpec::get(client.data_path("/limits")))
//!     .await?;
//! let bytes = api::collect(body).await?;
//! # Ok(())
//! # }
//! ```

/// Default Salesforce API version (Winter '26 - API version 65.0).
pub const DEFAULT_API_VERSION: &str = "65.0";

/// Default connection timeout for HTTP requests (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default request timeout for HTTP requests (120 seconds).
///
/// Long enough to outlast a Bayeux `/meta/connect` that the server holds open for up to
/// 110 seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default connection timeout for OAuth2 authentication requests (15 seconds).
pub const DEFAULT_AUTH_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default request timeout for OAuth2 authentication requests (30 seconds).
pub const DEFAULT_AUTH_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default bound on reaching a connected state after a Bayeux handshake (120 seconds).
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 120;

/// Default bound on waiting for a subscribe/unsubscribe confirmation (40 seconds).
pub const DEFAULT_CHANNEL_TIMEOUT_SECS: u64 = 40;

/// Default pause before retrying a failed `/meta/connect` when the server gives no advice.
pub const DEFAULT_RECONNECT_BACKOFF_MILLIS: u64 = 1_000;

/// OAuth2 password-grant session management.
pub mod session;

/// REST API execution with session-expiry recovery and error decoding.
pub mod api;

/// Streaming API push-topic subscriptions over Bayeux long polling.
pub mod streaming;

/// Coarse classification of a failure, shared by every error type in the crate.
///
/// Lets callers tell bad input, authorization problems, missing resources and transient
/// failures apart without inspecting message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request or configuration was rejected as invalid.
    BadInput,
    /// Credentials or the session were refused.
    NotAuthorized,
    /// The addressed resource does not exist.
    NotFound,
    /// A timeout, throttling or server-side failure that may succeed if retried.
    Transient,
    /// Anything else.
    Other,
}

impl ErrorKind {
    /// Classifies an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 405 | 409 | 412 | 415 => ErrorKind::BadInput,
            401 | 403 => ErrorKind::NotAuthorized,
            404 | 410 => ErrorKind::NotFound,
            408 | 429 | 500..=599 => ErrorKind::Transient,
            _ => ErrorKind::Other,
        }
    }
}
