//! Push transport abstraction used by the streaming engine.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::session;
use crate::ErrorKind;

/// Callback invoked with `(channel, raw message)` for every inbound data message.
///
/// Runs on the transport's receive task; keep it short or hand the work off.
pub type MessageListener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Callback invoked for every meta-channel outcome.
pub type MetaListener = Arc<dyn Fn(&MetaEvent) + Send + Sync>;

/// Handle of a listener registered on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Bayeux meta channels whose outcomes are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaChannel {
    /// `/meta/handshake`
    Handshake,
    /// `/meta/connect`
    Connect,
    /// `/meta/subscribe`
    Subscribe,
    /// `/meta/unsubscribe`
    Unsubscribe,
    /// `/meta/disconnect`
    Disconnect,
}

impl MetaChannel {
    /// Returns the channel path.
    pub fn path(self) -> &'static str {
        match self {
            MetaChannel::Handshake => "/meta/handshake",
            MetaChannel::Connect => "/meta/connect",
            MetaChannel::Subscribe => "/meta/subscribe",
            MetaChannel::Unsubscribe => "/meta/unsubscribe",
            MetaChannel::Disconnect => "/meta/disconnect",
        }
    }

    /// Parses a channel path.
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/meta/handshake" => Some(MetaChannel::Handshake),
            "/meta/connect" => Some(MetaChannel::Connect),
            "/meta/subscribe" => Some(MetaChannel::Subscribe),
            "/meta/unsubscribe" => Some(MetaChannel::Unsubscribe),
            "/meta/disconnect" => Some(MetaChannel::Disconnect),
            _ => None,
        }
    }
}

impl fmt::Display for MetaChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Outcome of a meta-channel exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEvent {
    /// Meta channel the outcome belongs to.
    pub channel: MetaChannel,
    /// Whether the server accepted the request.
    pub successful: bool,
    /// Channel a subscribe/unsubscribe outcome refers to.
    pub subscription: Option<String>,
    /// Server error string, e.g. `403::Handshake denied`.
    pub error: Option<String>,
    /// Local failure that prevented the exchange.
    pub failure: Option<String>,
}

impl MetaEvent {
    /// Creates a successful outcome.
    pub fn success(channel: MetaChannel) -> Self {
        Self {
            channel,
            successful: true,
            subscription: None,
            error: None,
            failure: None,
        }
    }

    /// Creates an outcome refused by the server.
    pub fn refused(channel: MetaChannel, error: impl Into<String>) -> Self {
        Self {
            channel,
            successful: false,
            subscription: None,
            error: Some(error.into()),
            failure: None,
        }
    }

    /// Creates an outcome for an exchange that failed locally.
    pub fn failed(channel: MetaChannel, failure: impl Into<String>) -> Self {
        Self {
            channel,
            successful: false,
            subscription: None,
            error: None,
            failure: Some(failure.into()),
        }
    }

    /// Attaches the channel a subscribe/unsubscribe outcome refers to.
    pub fn for_subscription(mut self, channel: impl Into<String>) -> Self {
        self.subscription = Some(channel.into());
        self
    }

    /// Returns the most specific description of a failure.
    pub fn reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.failure.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// What a subscribe did on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First listener on the channel; `/meta/subscribe` was sent and its outcome follows
    /// as a [`MetaEvent`].
    Requested,
    /// The channel already had listeners; the listener joined without a server request.
    Joined,
}

/// What an unsubscribe did on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// The last listener left and `/meta/unsubscribe` was sent; its outcome follows as a
    /// [`MetaEvent`].
    Requested,
    /// Other listeners remain on the channel; only the local listener was removed.
    LocalOnly,
}

/// Errors raised by a push transport.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// The push endpoint answered with a non-2xx status.
    #[error("Push endpoint returned {status} {reason}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Reason phrase for the status.
        reason: String,
    },
    /// Network or I/O failure.
    #[error("Push transport error: {source}")]
    Network {
        #[source]
        source: reqwest::Error,
    },
    /// Acquiring or refreshing the session failed.
    #[error("Session error: {source}")]
    Session {
        #[source]
        source: session::Error,
    },
    /// The server sent something that is not a Bayeux message list.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The access token cannot be used as a header value.
    #[error("Invalid header value: {source}")]
    InvalidHeader {
        #[source]
        source: reqwest::header::InvalidHeaderValue,
    },
    /// The push endpoint URL is invalid.
    #[error("Invalid push endpoint: {source}")]
    ParseUrl {
        #[source]
        source: url::ParseError,
    },
    /// Failed to construct the HTTP client.
    #[error("Failed to build HTTP client: {source}")]
    HttpClientBuild {
        #[source]
        source: reqwest::Error,
    },
    /// An operation needs a client id and no handshake has succeeded.
    #[error("Not handshaken")]
    NotHandshaken,
    /// The transport was disconnected.
    #[error("Transport closed")]
    Closed,
    /// Internal state lock was poisoned.
    #[error("Lock error")]
    LockError,
}

impl TransportError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Http { status, .. } => ErrorKind::from_status(*status),
            TransportError::Network { .. } => ErrorKind::Transient,
            TransportError::Session { source } => source.kind(),
            TransportError::InvalidHeader { .. } | TransportError::ParseUrl { .. } => {
                ErrorKind::BadInput
            }
            TransportError::Protocol(_)
            | TransportError::HttpClientBuild { .. }
            | TransportError::NotHandshaken
            | TransportError::Closed
            | TransportError::LockError => ErrorKind::Other,
        }
    }
}

/// Classifies a Bayeux error string of the form `code::args::message`.
pub(crate) fn bayeux_error_kind(error: &str) -> ErrorKind {
    error
        .split("::")
        .next()
        .and_then(|code| code.trim().parse::<u16>().ok())
        .map(ErrorKind::from_status)
        .unwrap_or(ErrorKind::Other)
}

/// A long-lived push client the streaming engine drives.
///
/// Implementations report every meta-channel outcome to the listener installed with
/// [`PushTransport::set_meta_listener`], including outcomes of exchanges they start on
/// their own (reconnects, re-handshakes, resubscriptions).
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Installs the meta-channel listener, replacing any previous one.
    fn set_meta_listener(&self, listener: MetaListener);

    /// Performs the handshake and starts the receive loop on success.
    ///
    /// Returns an error only when the exchange itself fails; a refused handshake is
    /// reported through the meta listener.
    async fn handshake(&self) -> Result<(), TransportError>;

    /// Adds `listener` to `channel`, subscribing on the server for the first listener.
    async fn subscribe(
        &self,
        channel: &str,
        listener: MessageListener,
    ) -> Result<(ListenerId, SubscribeOutcome), TransportError>;

    /// Removes `listener` from `channel`, unsubscribing on the server for the last one.
    async fn unsubscribe(
        &self,
        channel: &str,
        listener: ListenerId,
    ) -> Result<UnsubscribeOutcome, TransportError>;

    /// Removes `listener` locally without contacting the server.
    fn detach(&self, channel: &str, listener: ListenerId);

    /// Stops the receive loop and ends the server-side session.
    async fn disconnect(&self) -> Result<(), TransportError>;
}
