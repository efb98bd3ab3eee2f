//! Streaming API push-topic subscriptions.
//!
//! This module provides:
//! - **Topic provisioning**: idempotent create-or-update of `PushTopic` records
//! - **Push transport**: a Bayeux long-polling client with re-authentication and
//!   resubscription after a re-handshake
//! - **Subscription engine**: handshake lifecycle, per-consumer subscriptions with
//!   bounded confirmation waits, and message dispatch
//!
//! # Example
//!
//! ```no_run
//! use salesforce_access::{api, session, streaming};
//! use salesforce_access::streaming::{SubscribeRequest, TopicProvisioner};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Arc::new(
//!     session::Builder::new()
//!         .credentials_path(PathBuf::from("credentials.json"))
//!         .build()?,
//! );
//! let api = Arc::new(api::Client::new(session.clone(), api::Config::default()).await?);
//! let engine = streaming::Engine::new(
//!     session,
//!     TopicProvisioner::new(api),
//!     streaming::Config::default(),
//! );
//!
//! engine.start().await?;
//! engine
//!     .subscribe(
//!         &SubscribeRequest::new("AccountUpdates", "audit")
//!             .filter_query("SELECT Id, Name FROM Account"),
//!         |channel, message| println!("{channel}: {message}"),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

mod bayeux;
mod engine;
mod outcome;
pub mod topic;
mod transport;

pub use bayeux::BayeuxClient;
pub use engine::{ChannelOperation, Engine, EngineState, Error, SubscribeRequest};
pub use topic::{
    NotifyForFields, NotifyForOperations, Provisioned, PushTopicDefinition, TopicProvisioner,
};
pub use transport::{
    ListenerId, MessageListener, MetaChannel, MetaEvent, MetaListener, PushTransport,
    SubscribeOutcome, TransportError, UnsubscribeOutcome,
};

/// First API version served on the versioned push endpoint.
const VERSIONED_ENDPOINT_SINCE: f64 = 24.0;

/// Parses `"65.0"` (or `"v65.0"`) into a number for version comparisons.
pub(crate) fn api_version_number(version: &str) -> Option<f64> {
    version.trim().trim_start_matches('v').parse().ok()
}

/// Naming scheme for the push endpoint and topic channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelConvention {
    /// Endpoint `/cometd`, channels `/topic/<name>`.
    Legacy,
    /// Endpoint `/cometd/<version>`, channels `/topic/<name>`; names already qualified as
    /// `event/...` or `data/...` map to `/<name>`.
    Versioned,
}

impl ChannelConvention {
    /// Picks the convention served for `api_version`.
    pub fn for_api_version(api_version: &str) -> Self {
        match api_version_number(api_version) {
            Some(version) if version < VERSIONED_ENDPOINT_SINCE => ChannelConvention::Legacy,
            _ => ChannelConvention::Versioned,
        }
    }

    /// Returns the push endpoint path relative to the instance URL.
    pub fn endpoint_path(self, api_version: &str) -> String {
        match self {
            ChannelConvention::Legacy => "/cometd".to_string(),
            ChannelConvention::Versioned => format!("/cometd/{api_version}"),
        }
    }

    /// Derives the channel for `topic`.
    ///
    /// Names that already start with `/` are used verbatim.
    pub fn channel(self, topic: &str) -> String {
        if topic.starts_with('/') {
            return topic.to_string();
        }
        match self {
            ChannelConvention::Versioned
                if topic.starts_with("event/") || topic.starts_with("data/") =>
            {
                format!("/{topic}")
            }
            _ => format!("/topic/{topic}"),
        }
    }
}

/// Settings for a streaming [`Engine`].
#[derive(Debug, Clone)]
pub struct Config {
    /// API version for the push endpoint and topic provisioning.
    pub api_version: String,
    /// Bound on reaching the connected state during [`Engine::start`].
    pub handshake_timeout: Duration,
    /// Bound on waiting for a subscribe or unsubscribe confirmation.
    pub channel_timeout: Duration,
    /// Overrides the convention derived from `api_version`.
    pub convention: Option<ChannelConvention>,
    /// Pause before retrying a failed long poll when the server gives no advice.
    pub reconnect_backoff: Duration,
    /// TCP connect timeout of the push transport.
    pub connect_timeout: Duration,
    /// Per-request timeout of the push transport; must outlast the server's long poll.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_version: crate::DEFAULT_API_VERSION.to_string(),
            handshake_timeout: Duration::from_secs(crate::DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            channel_timeout: Duration::from_secs(crate::DEFAULT_CHANNEL_TIMEOUT_SECS),
            convention: None,
            reconnect_backoff: Duration::from_millis(crate::DEFAULT_RECONNECT_BACKOFF_MILLIS),
            connect_timeout: Duration::from_secs(crate::DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(crate::DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl Config {
    /// Sets the API version.
    pub fn api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Sets the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the subscribe/unsubscribe confirmation timeout.
    pub fn channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = timeout;
        self
    }

    /// Forces a channel convention.
    pub fn convention(mut self, convention: ChannelConvention) -> Self {
        self.convention = Some(convention);
        self
    }

    /// Sets the reconnect backoff.
    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Sets the push transport's connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the push transport's request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the effective channel convention.
    pub fn effective_convention(&self) -> ChannelConvention {
        self.convention
            .unwrap_or_else(|| ChannelConvention::for_api_version(&self.api_version))
    }
}
