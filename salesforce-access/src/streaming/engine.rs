//! Streaming subscription engine.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::bayeux::BayeuxClient;
use super::outcome::{ChannelOutcomes, Wait};
use super::topic::{
    self, NotifyForFields, NotifyForOperations, PushTopicDefinition, TopicProvisioner,
};
use super::transport::{
    bayeux_error_kind, ListenerId, MessageListener, PushTransport, SubscribeOutcome,
    TransportError, UnsubscribeOutcome,
};
use super::{ChannelConvention, Config};
use crate::session::{self, SessionManager};
use crate::ErrorKind;

/// Channel operation awaiting confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOperation {
    /// `/meta/subscribe`
    Subscribe,
    /// `/meta/unsubscribe`
    Unsubscribe,
}

impl fmt::Display for ChannelOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOperation::Subscribe => f.write_str("subscribe"),
            ChannelOperation::Unsubscribe => f.write_str("unsubscribe"),
        }
    }
}

/// Lifecycle of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created, not started.
    Unstarted,
    /// Handshake in progress.
    Handshaking,
    /// Handshake done and the transport is polling.
    Connected,
    /// Shut down; terminal.
    Shutdown,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Unstarted => "unstarted",
            EngineState::Handshaking => "handshaking",
            EngineState::Connected => "connected",
            EngineState::Shutdown => "shut down",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during streaming operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Acquiring the session failed.
    #[error("Session error: {source}")]
    Session {
        #[source]
        source: session::Error,
    },
    /// Provisioning the push topic failed.
    #[error("Topic provisioning failed: {source}")]
    Topic {
        #[source]
        source: topic::Error,
    },
    /// The push transport failed.
    #[error("Push transport error: {source}")]
    Transport {
        #[source]
        source: TransportError,
    },
    /// The handshake was refused or could not be performed.
    #[error("Handshake failed: {}", error.as_deref().unwrap_or("no details from server"))]
    Handshake {
        /// Server error string.
        error: Option<String>,
        /// Local failure that prevented the handshake.
        #[source]
        source: Option<TransportError>,
    },
    /// The connected state was not reached in time.
    #[error("Handshake did not complete within {timeout:?}")]
    HandshakeTimeout {
        /// Configured bound.
        timeout: Duration,
    },
    /// A subscribe or unsubscribe was not confirmed in time.
    #[error("Timed out waiting for {operation} confirmation on {channel}")]
    ConfirmationTimeout {
        /// Channel name.
        channel: String,
        /// Pending operation.
        operation: ChannelOperation,
    },
    /// The server refused the subscription.
    #[error("Subscription to {channel} failed: {reason}")]
    SubscriptionFailed {
        /// Channel name.
        channel: String,
        /// Server-provided reason.
        reason: String,
    },
    /// The server refused the unsubscription.
    #[error("Unsubscription from {channel} failed: {reason}")]
    UnsubscribeFailed {
        /// Channel name.
        channel: String,
        /// Server-provided reason.
        reason: String,
    },
    /// The consumer already has a subscription.
    #[error("Consumer {consumer_id} is already subscribed")]
    AlreadySubscribed {
        /// Consumer identity.
        consumer_id: String,
    },
    /// The engine is not connected.
    #[error("Streaming engine is not connected")]
    NotConnected,
    /// The operation is not valid in the engine's current state.
    #[error("Invalid engine state: {state}")]
    InvalidState {
        /// State the engine was in.
        state: EngineState,
    },
    /// The caller cancelled the wait.
    #[error("Operation cancelled")]
    Cancelled,
    /// Internal state lock was poisoned.
    #[error("Lock error")]
    LockError,
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Session { source } => source.kind(),
            Error::Topic { source } => source.kind(),
            Error::Transport { source } => source.kind(),
            Error::Handshake { error, source } => match (error, source) {
                (Some(error), _) => bayeux_error_kind(error),
                (None, Some(source)) => source.kind(),
                (None, None) => ErrorKind::Other,
            },
            Error::SubscriptionFailed { reason, .. } | Error::UnsubscribeFailed { reason, .. } => {
                bayeux_error_kind(reason)
            }
            Error::HandshakeTimeout { .. } | Error::ConfirmationTimeout { .. } => {
                ErrorKind::Transient
            }
            Error::AlreadySubscribed { .. } | Error::NotConnected | Error::InvalidState { .. } => {
                ErrorKind::BadInput
            }
            Error::Cancelled | Error::LockError => ErrorKind::Other,
        }
    }
}

/// A consumer's request to receive notifications from a topic.
///
/// With a filter query, the topic is provisioned before subscribing.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    /// Topic name, e.g. `AccountUpdates` or `event/Order__e`.
    pub topic: String,
    /// Identity of the consumer; one subscription per consumer.
    pub consumer_id: String,
    /// SOQL query the topic must carry.
    pub filter_query: Option<String>,
    /// Fields evaluated when the topic is provisioned.
    pub notify_for_fields: NotifyForFields,
    /// Operations that notify when the topic is provisioned.
    pub notify_for_operations: NotifyForOperations,
    /// Whether an existing topic with different settings may be updated.
    pub allow_update: bool,
}

impl SubscribeRequest {
    /// Creates a request that subscribes without provisioning.
    pub fn new(topic: impl Into<String>, consumer_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            consumer_id: consumer_id.into(),
            filter_query: None,
            notify_for_fields: NotifyForFields::default(),
            notify_for_operations: NotifyForOperations::default(),
            allow_update: false,
        }
    }

    /// Provisions the topic with `query` before subscribing.
    pub fn filter_query(mut self, query: impl Into<String>) -> Self {
        self.filter_query = Some(query.into());
        self
    }

    /// Sets which fields are evaluated.
    pub fn notify_for_fields(mut self, fields: NotifyForFields) -> Self {
        self.notify_for_fields = fields;
        self
    }

    /// Sets which operations notify.
    pub fn notify_for_operations(mut self, operations: NotifyForOperations) -> Self {
        self.notify_for_operations = operations;
        self
    }

    /// Allows updating an existing topic whose settings differ.
    pub fn allow_update(mut self, allow: bool) -> Self {
        self.allow_update = allow;
        self
    }

    fn definition(&self, api_version: &str) -> Option<PushTopicDefinition> {
        self.filter_query.as_ref().map(|query| PushTopicDefinition {
            name: self.topic.clone(),
            query: query.clone(),
            notify_for_fields: self.notify_for_fields,
            notify_for_operations: self.notify_for_operations,
            api_version: api_version.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct Registration {
    channel: String,
    listener: ListenerId,
}

/// Push subscription engine.
///
/// Drives one push transport through `Unstarted → Handshaking → Connected → Shutdown`,
/// provisions topics, and keeps a registry of one subscription per consumer. Subscribe
/// and unsubscribe wait, bounded by [`Config::channel_timeout`], for the server's
/// confirmation as reported on the meta channels.
///
/// Inbound messages are delivered on the transport's receive task; consumer callbacks
/// should return quickly. The engine does no queuing of its own.
pub struct Engine {
    session: Arc<SessionManager>,
    provisioner: TopicProvisioner,
    config: Config,
    convention: ChannelConvention,
    outcomes: Arc<ChannelOutcomes>,
    state: Mutex<EngineState>,
    transport: RwLock<Option<Arc<dyn PushTransport>>>,
    registry: Mutex<HashMap<String, Registration>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state().ok())
            .field("convention", &self.convention)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl Engine {
    /// Creates an engine. No network call is made until [`Engine::start`].
    pub fn new(
        session: Arc<SessionManager>,
        provisioner: TopicProvisioner,
        config: Config,
    ) -> Self {
        let convention = config.effective_convention();
        Self {
            session,
            provisioner,
            config,
            convention,
            outcomes: Arc::new(ChannelOutcomes::new()),
            state: Mutex::new(EngineState::Unstarted),
            transport: RwLock::new(None),
            registry: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the current lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the state lock is poisoned.
    pub fn state(&self) -> Result<EngineState, Error> {
        self.state
            .lock()
            .map(|state| *state)
            .map_err(|_| Error::LockError)
    }

    /// Returns the active channel convention.
    pub fn convention(&self) -> ChannelConvention {
        self.convention
    }

    /// Returns the channel a topic maps to.
    pub fn channel_for(&self, topic: &str) -> String {
        self.convention.channel(topic)
    }

    /// Returns `true` if `consumer_id` has a confirmed subscription.
    pub fn is_subscribed(&self, consumer_id: &str) -> bool {
        self.registry
            .lock()
            .map(|registry| registry.contains_key(consumer_id))
            .unwrap_or(false)
    }

    /// Returns the number of registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.registry.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Returns the channels the server currently confirms.
    pub fn confirmed_channels(&self) -> HashSet<String> {
        self.outcomes.confirmed()
    }

    /// Connects with a [`BayeuxClient`] at the instance's push endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No session can be acquired ([`Error::Session`])
    /// - The engine was already started ([`Error::InvalidState`])
    /// - The handshake is refused or fails ([`Error::Handshake`])
    /// - The connected state is not reached in time ([`Error::HandshakeTimeout`])
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn start(&self) -> Result<(), Error> {
        self.expect_state(EngineState::Unstarted)?;

        if self.session.current_token().await.is_none() {
            self.session
                .login(None)
                .await
                .map_err(|source| Error::Session { source })?;
        }
        let instance_url = self.session.instance_url().await.ok_or(Error::NotConnected)?;
        let endpoint = format!(
            "{}{}",
            instance_url.trim_end_matches('/'),
            self.convention.endpoint_path(&self.config.api_version)
        );
        let endpoint = Url::parse(&endpoint).map_err(|source| Error::Transport {
            source: TransportError::ParseUrl { source },
        })?;

        let client = BayeuxClient::new(self.session.clone(), endpoint, &self.config)
            .map_err(|source| Error::Transport { source })?;
        self.start_with_transport(Arc::new(client)).await
    }

    /// Connects with a caller-supplied transport.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::start`], except for session acquisition.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn start_with_transport(
        &self,
        transport: Arc<dyn PushTransport>,
    ) -> Result<(), Error> {
        self.transition(EngineState::Unstarted, EngineState::Handshaking)?;

        self.outcomes.begin_handshake();
        let outcomes = self.outcomes.clone();
        transport.set_meta_listener(Arc::new(move |event| outcomes.record(event)));

        let result = match self.handshake(transport.as_ref()).await {
            Ok(()) => self.install(&transport),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if let Err(disconnect) = transport.disconnect().await {
                debug!(error = %disconnect, "disconnect after failed start");
            }
            // A concurrent shutdown has already moved the engine to its terminal state.
            match self.transition(EngineState::Handshaking, EngineState::Unstarted) {
                Ok(()) | Err(Error::InvalidState { .. }) => {}
                Err(other) => return Err(other),
            }
            return Err(e);
        }

        info!(convention = ?self.convention, "streaming engine connected");
        Ok(())
    }

    /// Stores the transport and enters `Connected`, unless the engine left `Handshaking`.
    fn install(&self, transport: &Arc<dyn PushTransport>) -> Result<(), Error> {
        let mut state = self.state.lock().map_err(|_| Error::LockError)?;
        if *state != EngineState::Handshaking {
            return Err(Error::InvalidState { state: *state });
        }
        *self.transport.write().map_err(|_| Error::LockError)? = Some(transport.clone());
        *state = EngineState::Connected;
        Ok(())
    }

    async fn handshake(&self, transport: &dyn PushTransport) -> Result<(), Error> {
        let bound = self.config.handshake_timeout;
        let deadline = Instant::now() + bound;

        match tokio::time::timeout_at(deadline, transport.handshake()).await {
            Err(_) => return Err(Error::HandshakeTimeout { timeout: bound }),
            Ok(Err(source)) => {
                return Err(Error::Handshake {
                    error: None,
                    source: Some(source),
                })
            }
            Ok(Ok(())) => {}
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let never = CancellationToken::new();
        let wait = self.outcomes.wait_connected(remaining, &never);
        match self.guarded(wait).await {
            Wait::Done(Ok(())) => Ok(()),
            Wait::Done(Err(failure)) => Err(Error::Handshake {
                error: failure.error.or(failure.failure),
                source: None,
            }),
            Wait::TimedOut => Err(Error::HandshakeTimeout { timeout: bound }),
            Wait::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Subscribes `on_message` to the topic of `request`.
    ///
    /// See [`Engine::subscribe_with_cancel`].
    pub async fn subscribe<F>(&self, request: &SubscribeRequest, on_message: F) -> Result<(), Error>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.subscribe_with_cancel(request, on_message, &CancellationToken::new())
            .await
    }

    /// Provisions the topic when the request has a filter query, subscribes, and waits
    /// for the server to confirm the channel.
    ///
    /// The consumer is registered only once the subscription is confirmed.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The engine is not connected ([`Error::NotConnected`])
    /// - The consumer is already subscribed ([`Error::AlreadySubscribed`])
    /// - Provisioning fails ([`Error::Topic`])
    /// - The server refuses the subscription ([`Error::SubscriptionFailed`])
    /// - No confirmation arrives in time ([`Error::ConfirmationTimeout`])
    /// - `cancel` fires or the engine shuts down while waiting ([`Error::Cancelled`])
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn subscribe_with_cancel<F>(
        &self,
        request: &SubscribeRequest,
        on_message: F,
        cancel: &CancellationToken,
    ) -> Result<(), Error>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let transport = self.connected_transport()?;
        if self.registry()?.contains_key(&request.consumer_id) {
            return Err(Error::AlreadySubscribed {
                consumer_id: request.consumer_id.clone(),
            });
        }

        if let Some(definition) = request.definition(&self.config.api_version) {
            self.provisioner
                .ensure_topic(&definition, request.allow_update)
                .await
                .map_err(|source| Error::Topic { source })?;
        }

        let channel = self.convention.channel(&request.topic);
        let consumer_id = request.consumer_id.clone();
        let listener: MessageListener = Arc::new(move |channel: &str, message: &Value| {
            debug!(consumer = %consumer_id, channel, "dispatching push message");
            on_message(channel, message);
        });

        let mark = self.outcomes.subscribe_mark(&channel);
        let (listener_id, outcome) = transport
            .subscribe(&channel, listener)
            .await
            .map_err(|source| Error::Transport { source })?;

        // Only a reply to this request may settle a fresh subscription.
        let since = (outcome == SubscribeOutcome::Requested).then_some(mark);
        let wait = self
            .outcomes
            .wait_subscribed(&channel, since, self.config.channel_timeout, cancel);
        let failure = match self.guarded(wait).await {
            Wait::Done(Ok(())) => None,
            Wait::Done(Err(reason)) => Some(Error::SubscriptionFailed {
                channel: channel.clone(),
                reason,
            }),
            Wait::TimedOut => Some(Error::ConfirmationTimeout {
                channel: channel.clone(),
                operation: ChannelOperation::Subscribe,
            }),
            Wait::Cancelled => Some(Error::Cancelled),
        };
        if let Some(error) = failure {
            transport.detach(&channel, listener_id);
            return Err(error);
        }

        let mut registry = self.registry()?;
        if registry.contains_key(&request.consumer_id) {
            drop(registry);
            transport.detach(&channel, listener_id);
            return Err(Error::AlreadySubscribed {
                consumer_id: request.consumer_id.clone(),
            });
        }
        registry.insert(
            request.consumer_id.clone(),
            Registration {
                channel: channel.clone(),
                listener: listener_id,
            },
        );
        info!(consumer = %request.consumer_id, %channel, "subscribed");
        Ok(())
    }

    /// Removes the subscription of `consumer_id` on `topic`.
    ///
    /// See [`Engine::unsubscribe_with_cancel`].
    pub async fn unsubscribe(&self, topic: &str, consumer_id: &str) -> Result<(), Error> {
        self.unsubscribe_with_cancel(topic, consumer_id, &CancellationToken::new())
            .await
    }

    /// Removes the subscription of `consumer_id` on `topic` and, when it was the channel's
    /// last listener, waits for the server to confirm the unsubscription.
    ///
    /// Unknown consumers are a no-op. The registry entry is removed before the request is
    /// sent and is not restored on failure. Cancellation stops the wait and returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The transport fails ([`Error::Transport`])
    /// - The server refuses ([`Error::UnsubscribeFailed`])
    /// - No confirmation arrives in time ([`Error::ConfirmationTimeout`])
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn unsubscribe_with_cancel(
        &self,
        topic: &str,
        consumer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let channel = self.convention.channel(topic);
        let registration = {
            let mut registry = self.registry()?;
            let on_channel = registry
                .get(consumer_id)
                .is_some_and(|registration| registration.channel == channel);
            if on_channel {
                registry.remove(consumer_id)
            } else {
                None
            }
        };
        let Some(registration) = registration else {
            debug!(consumer = %consumer_id, %channel, "no subscription to remove");
            return Ok(());
        };

        let transport = self.connected_transport()?;
        let mark = self.outcomes.unsubscribe_mark(&channel);
        let outcome = transport
            .unsubscribe(&channel, registration.listener)
            .await
            .map_err(|source| Error::Transport { source })?;
        if outcome == UnsubscribeOutcome::LocalOnly {
            info!(consumer = %consumer_id, %channel, "unsubscribed, channel still in use");
            return Ok(());
        }

        let wait = self
            .outcomes
            .wait_unsubscribed(&channel, mark, self.config.channel_timeout, cancel);
        match self.guarded(wait).await {
            Wait::Done(Ok(())) => {
                info!(consumer = %consumer_id, %channel, "unsubscribed");
                Ok(())
            }
            Wait::Done(Err(reason)) => Err(Error::UnsubscribeFailed { channel, reason }),
            Wait::TimedOut => Err(Error::ConfirmationTimeout {
                channel,
                operation: ChannelOperation::Unsubscribe,
            }),
            Wait::Cancelled => {
                debug!(%channel, "stopped waiting for unsubscription");
                Ok(())
            }
        }
    }

    /// Disconnects the transport and forgets every subscription.
    ///
    /// Channels are not unsubscribed first. Waits in progress end with
    /// [`Error::Cancelled`] (subscribe) or `Ok` (unsubscribe).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the disconnect request fails; the engine is shut
    /// down regardless.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.set_state(EngineState::Shutdown)?;
        self.shutdown.cancel();
        self.registry()?.clear();

        let transport = self.transport.write().map_err(|_| Error::LockError)?.take();
        if let Some(transport) = transport {
            transport
                .disconnect()
                .await
                .map_err(|source| Error::Transport { source })?;
        }
        info!("streaming engine shut down");
        Ok(())
    }

    /// Runs a wait that also ends when the engine shuts down.
    async fn guarded<T>(&self, wait: impl Future<Output = Wait<T>>) -> Wait<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Wait::Cancelled,
            outcome = wait => outcome,
        }
    }

    fn registry(&self) -> Result<MutexGuard<'_, HashMap<String, Registration>>, Error> {
        self.registry.lock().map_err(|_| Error::LockError)
    }

    fn connected_transport(&self) -> Result<Arc<dyn PushTransport>, Error> {
        if self.state()? != EngineState::Connected {
            return Err(Error::NotConnected);
        }
        self.transport
            .read()
            .map_err(|_| Error::LockError)?
            .clone()
            .ok_or(Error::NotConnected)
    }

    fn expect_state(&self, expected: EngineState) -> Result<(), Error> {
        let state = *self.state.lock().map_err(|_| Error::LockError)?;
        if state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState { state })
        }
    }

    fn transition(&self, from: EngineState, to: EngineState) -> Result<(), Error> {
        let mut state = self.state.lock().map_err(|_| Error::LockError)?;
        if *state != from {
            return Err(Error::InvalidState { state: *state });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: EngineState) -> Result<(), Error> {
        let mut state = self.state.lock().map_err(|_| Error::LockError)?;
        if *state != to {
            debug!(from = %*state, %to, "engine state change");
        }
        *state = to;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if matches!(self.state(), Ok(EngineState::Connected)) {
            warn!("streaming engine dropped without shutdown");
        }
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api;
    use crate::session::testing::manager;
    use crate::streaming::transport::{MetaChannel, MetaEvent, MetaListener};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Reply {
        Accept,
        Refuse,
        Silent,
    }

    /// Scripted transport: answers meta requests as configured, synchronously.
    struct FakeTransport {
        handshake: Reply,
        handshake_error: bool,
        subscribe: Reply,
        unsubscribe: Reply,
        meta: Mutex<Option<MetaListener>>,
        listeners: Mutex<HashMap<String, Vec<(ListenerId, MessageListener)>>>,
        next_id: AtomicU64,
        unsubscribe_requests: AtomicUsize,
        disconnected: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                handshake: Reply::Accept,
                handshake_error: false,
                subscribe: Reply::Accept,
                unsubscribe: Reply::Accept,
                meta: Mutex::new(None),
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                unsubscribe_requests: AtomicUsize::new(0),
                disconnected: AtomicBool::new(false),
            }
        }

        fn emit(&self, event: MetaEvent) {
            let listener = self.meta.lock().unwrap().clone();
            if let Some(listener) = listener {
                listener(&event);
            }
        }

        fn reply(&self, reply: Reply, meta: MetaChannel, channel: &str) {
            match reply {
                Reply::Accept => self.emit(MetaEvent::success(meta).for_subscription(channel)),
                Reply::Refuse => self.emit(
                    MetaEvent::refused(meta, "400::The channel you requested does not exist")
                        .for_subscription(channel),
                ),
                Reply::Silent => {}
            }
        }

        fn deliver(&self, channel: &str, message: &Value) {
            let listeners: Vec<MessageListener> = self
                .listeners
                .lock()
                .unwrap()
                .get(channel)
                .map(|l| l.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default();
            for listener in listeners {
                listener(channel, message);
            }
        }

        fn listener_count(&self, channel: &str) -> usize {
            self.listeners
                .lock()
                .unwrap()
                .get(channel)
                .map(Vec::len)
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl PushTransport for FakeTransport {
        fn set_meta_listener(&self, listener: MetaListener) {
            *self.meta.lock().unwrap() = Some(listener);
        }

        async fn handshake(&self) -> Result<(), TransportError> {
            if self.handshake_error {
                return Err(TransportError::Protocol("connection refused".to_string()));
            }
            match self.handshake {
                Reply::Accept => {
                    self.emit(MetaEvent::success(MetaChannel::Handshake));
                    self.emit(MetaEvent::success(MetaChannel::Connect));
                }
                Reply::Refuse => {
                    self.emit(MetaEvent::refused(MetaChannel::Handshake, "403::Handshake denied"))
                }
                Reply::Silent => {}
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            channel: &str,
            listener: MessageListener,
        ) -> Result<(ListenerId, SubscribeOutcome), TransportError> {
            let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let first = {
                let mut listeners = self.listeners.lock().unwrap();
                let entry = listeners.entry(channel.to_string()).or_default();
                entry.push((id, listener));
                entry.len() == 1
            };
            if !first {
                return Ok((id, SubscribeOutcome::Joined));
            }
            self.reply(self.subscribe, MetaChannel::Subscribe, channel);
            Ok((id, SubscribeOutcome::Requested))
        }

        async fn unsubscribe(
            &self,
            channel: &str,
            listener: ListenerId,
        ) -> Result<UnsubscribeOutcome, TransportError> {
            let last = {
                let mut listeners = self.listeners.lock().unwrap();
                let Some(entry) = listeners.get_mut(channel) else {
                    return Ok(UnsubscribeOutcome::LocalOnly);
                };
                entry.retain(|(id, _)| *id != listener);
                let last = entry.is_empty();
                if last {
                    listeners.remove(channel);
                }
                last
            };
            if !last {
                return Ok(UnsubscribeOutcome::LocalOnly);
            }
            self.unsubscribe_requests.fetch_add(1, Ordering::SeqCst);
            self.reply(self.unsubscribe, MetaChannel::Unsubscribe, channel);
            Ok(UnsubscribeOutcome::Requested)
        }

        fn detach(&self, channel: &str, listener: ListenerId) {
            let mut listeners = self.listeners.lock().unwrap();
            if let Some(entry) = listeners.get_mut(channel) {
                entry.retain(|(id, _)| *id != listener);
                if entry.is_empty() {
                    listeners.remove(channel);
                }
            }
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.disconnected.store(true, Ordering::SeqCst);
            self.emit(MetaEvent::success(MetaChannel::Disconnect));
            Ok(())
        }
    }

    fn config() -> Config {
        Config::default()
            .handshake_timeout(Duration::from_millis(200))
            .channel_timeout(Duration::from_millis(200))
    }

    async fn engine_for(instance_url: &str) -> Engine {
        let session = Arc::new(manager(instance_url));
        session.seed("T1", instance_url).await;
        let api = api::Client::new(session.clone(), api::Config::default())
            .await
            .unwrap();
        Engine::new(session, TopicProvisioner::new(Arc::new(api)), config())
    }

    async fn started(transport: FakeTransport) -> (Engine, Arc<FakeTransport>) {
        let engine = engine_for("https://x.my.salesforce.com").await;
        let transport = Arc::new(transport);
        engine.start_with_transport(transport.clone()).await.unwrap();
        (engine, transport)
    }

    fn ignore(_: &str, _: &Value) {}

    #[tokio::test]
    async fn test_start_connects() {
        let (engine, _) = started(FakeTransport::new()).await;
        assert_eq!(engine.state().unwrap(), EngineState::Connected);
        assert_eq!(engine.convention(), ChannelConvention::Versioned);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (engine, transport) = started(FakeTransport::new()).await;
        let result = engine.start_with_transport(transport).await;
        assert!(matches!(
            result,
            Err(Error::InvalidState { state: EngineState::Connected })
        ));
    }

    #[tokio::test]
    async fn test_refused_handshake_fails_start() {
        let engine = engine_for("https://x").await;
        let transport = Arc::new(FakeTransport {
            handshake: Reply::Refuse,
            ..FakeTransport::new()
        });

        let error = engine
            .start_with_transport(transport.clone())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::Handshake { error: Some(ref e), source: None } if e == "403::Handshake denied"
        ));
        assert_eq!(error.kind(), ErrorKind::NotAuthorized);
        assert_eq!(engine.state().unwrap(), EngineState::Unstarted);
        assert!(transport.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handshake_exception_fails_start() {
        let engine = engine_for("https://x").await;
        let transport = Arc::new(FakeTransport {
            handshake_error: true,
            ..FakeTransport::new()
        });

        let result = engine.start_with_transport(transport).await;
        assert!(matches!(
            result,
            Err(Error::Handshake { error: None, source: Some(TransportError::Protocol(_)) })
        ));
    }

    #[tokio::test]
    async fn test_silent_handshake_times_out() {
        let engine = engine_for("https://x").await;
        let transport = Arc::new(FakeTransport {
            handshake: Reply::Silent,
            ..FakeTransport::new()
        });

        let result = engine.start_with_transport(transport).await;
        assert!(matches!(result, Err(Error::HandshakeTimeout { .. })));
        assert_eq!(engine.state().unwrap(), EngineState::Unstarted);
    }

    #[tokio::test]
    async fn test_subscribe_before_start() {
        let engine = engine_for("https://x").await;
        let result = engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_subscribe_dispatches_messages() {
        let (engine, transport) = started(FakeTransport::new()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), move |channel, message| {
                let _ = tx.send((channel.to_string(), message.clone()));
            })
            .await
            .unwrap();

        assert!(engine.is_subscribed("c1"));
        assert!(engine.confirmed_channels().contains("/topic/Foo"));

        transport.deliver(
            "/topic/Foo",
            &json!({"channel": "/topic/Foo", "data": {"sobject": {"Id": "001"}}}),
        );
        let (channel, message) = rx.recv().await.unwrap();
        assert_eq!(channel, "/topic/Foo");
        assert_eq!(message["data"]["sobject"]["Id"], "001");
    }

    #[tokio::test]
    async fn test_unconfirmed_subscribe_times_out() {
        let (engine, transport) = started(FakeTransport {
            subscribe: Reply::Silent,
            ..FakeTransport::new()
        })
        .await;

        let error = engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::ConfirmationTimeout { ref channel, operation: ChannelOperation::Subscribe }
                if channel == "/topic/Foo"
        ));
        assert_eq!(error.kind(), ErrorKind::Transient);
        assert!(!engine.is_subscribed("c1"));
        assert_eq!(transport.listener_count("/topic/Foo"), 0);
    }

    #[tokio::test]
    async fn test_refused_subscribe_reports_reason() {
        let (engine, transport) = started(FakeTransport {
            subscribe: Reply::Refuse,
            ..FakeTransport::new()
        })
        .await;

        let error = engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::SubscriptionFailed { ref reason, .. } if reason.starts_with("400::")
        ));
        assert_eq!(error.kind(), ErrorKind::BadInput);
        assert_eq!(engine.subscription_count(), 0);
        assert_eq!(transport.listener_count("/topic/Foo"), 0);
    }

    #[tokio::test]
    async fn test_subscribe_then_unsubscribe_leaves_nothing() {
        let (engine, transport) = started(FakeTransport::new()).await;

        engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await
            .unwrap();
        engine.unsubscribe("Foo", "c1").await.unwrap();

        assert_eq!(engine.subscription_count(), 0);
        assert!(!engine.confirmed_channels().contains("/topic/Foo"));
        assert_eq!(transport.unsubscribe_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_consumer_is_rejected() {
        let (engine, _) = started(FakeTransport::new()).await;
        let request = SubscribeRequest::new("Foo", "c1");

        engine.subscribe(&request, ignore).await.unwrap();
        let result = engine.subscribe(&request, ignore).await;

        assert!(matches!(
            result,
            Err(Error::AlreadySubscribed { ref consumer_id }) if consumer_id == "c1"
        ));
    }

    #[tokio::test]
    async fn test_shared_channel_keeps_subscription_for_remaining_consumer() {
        let (engine, transport) = started(FakeTransport::new()).await;

        engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await
            .unwrap();
        engine
            .subscribe(&SubscribeRequest::new("Foo", "c2"), ignore)
            .await
            .unwrap();

        engine.unsubscribe("Foo", "c1").await.unwrap();
        assert_eq!(transport.unsubscribe_requests.load(Ordering::SeqCst), 0);
        assert!(engine.confirmed_channels().contains("/topic/Foo"));
        assert!(engine.is_subscribed("c2"));

        engine.unsubscribe("Foo", "c2").await.unwrap();
        assert_eq!(transport.unsubscribe_requests.load(Ordering::SeqCst), 1);
        assert!(engine.confirmed_channels().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_consumer_is_noop() {
        let (engine, transport) = started(FakeTransport::new()).await;

        engine.unsubscribe("Foo", "nobody").await.unwrap();

        engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await
            .unwrap();
        engine.unsubscribe("Bar", "c1").await.unwrap();
        assert!(engine.is_subscribed("c1"));
        assert_eq!(transport.unsubscribe_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_unsubscribe_times_out_without_restoring() {
        let (engine, _) = started(FakeTransport {
            unsubscribe: Reply::Silent,
            ..FakeTransport::new()
        })
        .await;

        engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await
            .unwrap();
        let result = engine.unsubscribe("Foo", "c1").await;

        assert!(matches!(
            result,
            Err(Error::ConfirmationTimeout { operation: ChannelOperation::Unsubscribe, .. })
        ));
        assert!(!engine.is_subscribed("c1"));
    }

    #[tokio::test]
    async fn test_refused_unsubscribe_is_reported() {
        let (engine, _) = started(FakeTransport {
            unsubscribe: Reply::Refuse,
            ..FakeTransport::new()
        })
        .await;

        engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await
            .unwrap();
        let result = engine.unsubscribe("Foo", "c1").await;

        assert!(matches!(result, Err(Error::UnsubscribeFailed { .. })));
        assert!(!engine.is_subscribed("c1"));
    }

    #[tokio::test]
    async fn test_cancelled_subscribe() {
        let (engine, transport) = started(FakeTransport {
            subscribe: Reply::Silent,
            ..FakeTransport::new()
        })
        .await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine
            .subscribe_with_cancel(&SubscribeRequest::new("Foo", "c1"), ignore, &cancel)
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!engine.is_subscribed("c1"));
        assert_eq!(transport.listener_count("/topic/Foo"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_unsubscribe_is_ok() {
        let (engine, _) = started(FakeTransport {
            unsubscribe: Reply::Silent,
            ..FakeTransport::new()
        })
        .await;
        engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine.unsubscribe_with_cancel("Foo", "c1", &cancel).await;

        assert!(result.is_ok());
        assert!(!engine.is_subscribed("c1"));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let (engine, transport) = started(FakeTransport::new()).await;
        engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await
            .unwrap();

        engine.shutdown().await.unwrap();

        assert_eq!(engine.state().unwrap(), EngineState::Shutdown);
        assert!(transport.disconnected.load(Ordering::SeqCst));
        assert_eq!(engine.subscription_count(), 0);
        let result = engine
            .subscribe(&SubscribeRequest::new("Foo", "c2"), ignore)
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_pending_subscribe() {
        let (engine, _) = started(FakeTransport {
            subscribe: Reply::Silent,
            ..FakeTransport::new()
        })
        .await;
        let engine = Arc::new(engine.with_channel_timeout(Duration::from_secs(5)));

        let pending = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown().await.unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_shutdown_during_start_is_terminal() {
        let engine = Arc::new(
            engine_for("https://x")
                .await
                .with_handshake_timeout(Duration::from_secs(5)),
        );
        let transport = Arc::new(FakeTransport {
            handshake: Reply::Silent,
            ..FakeTransport::new()
        });

        let pending = {
            let engine = engine.clone();
            let transport = transport.clone();
            tokio::spawn(async move { engine.start_with_transport(transport).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown().await.unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(engine.state().unwrap(), EngineState::Shutdown);
        assert!(transport.disconnected.load(Ordering::SeqCst));

        let restart = engine
            .start_with_transport(Arc::new(FakeTransport::new()))
            .await;
        assert!(matches!(
            restart,
            Err(Error::InvalidState { state: EngineState::Shutdown })
        ));
    }

    #[tokio::test]
    async fn test_earlier_confirmation_does_not_mask_refusal() {
        let (engine, transport) = started(FakeTransport {
            subscribe: Reply::Refuse,
            ..FakeTransport::new()
        })
        .await;
        transport.emit(MetaEvent::success(MetaChannel::Subscribe).for_subscription("/topic/Foo"));
        assert!(engine.confirmed_channels().contains("/topic/Foo"));

        let result = engine
            .subscribe(&SubscribeRequest::new("Foo", "c2"), ignore)
            .await;

        assert!(matches!(result, Err(Error::SubscriptionFailed { .. })));
        assert!(!engine.is_subscribed("c2"));
        assert_eq!(transport.listener_count("/topic/Foo"), 0);
    }

    #[tokio::test]
    async fn test_late_confirmation_does_not_settle_next_subscribe() {
        let (engine, transport) = started(FakeTransport {
            subscribe: Reply::Silent,
            ..FakeTransport::new()
        })
        .await;

        let first = engine
            .subscribe(&SubscribeRequest::new("Foo", "c1"), ignore)
            .await;
        assert!(matches!(first, Err(Error::ConfirmationTimeout { .. })));

        // Reply to the abandoned request.
        transport.emit(MetaEvent::success(MetaChannel::Subscribe).for_subscription("/topic/Foo"));

        let second = engine
            .subscribe(&SubscribeRequest::new("Foo", "c2"), ignore)
            .await;
        assert!(matches!(second, Err(Error::ConfirmationTimeout { .. })));
        assert!(!engine.is_subscribed("c2"));
    }

    #[tokio::test]
    async fn test_subscribe_provisions_topic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/data/v65.0/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 0, "done": true, "records": []
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/services/data/v65.0/sobjects/PushTopic"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "0IF1", "success": true, "errors": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine_for(&server.uri()).await;
        engine
            .start_with_transport(Arc::new(FakeTransport::new()))
            .await
            .unwrap();

        engine
            .subscribe(
                &SubscribeRequest::new("Foo", "c1").filter_query("SELECT Id FROM Account"),
                ignore,
            )
            .await
            .unwrap();
        assert!(engine.is_subscribed("c1"));
    }

    #[tokio::test]
    async fn test_provisioning_failure_skips_subscribe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/data/v65.0/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 1,
                "done": true,
                "records": [{
                    "Id": "0IF1",
                    "Name": "Foo",
                    "Query": "SELECT Id FROM Contact",
                    "NotifyForFields": "Referenced",
                    "NotifyForOperationCreate": true,
                    "NotifyForOperationUpdate": true,
                    "NotifyForOperationDelete": true,
                    "NotifyForOperationUndelete": true
                }]
            })))
            .mount(&server)
            .await;

        let engine = engine_for(&server.uri()).await;
        let transport = Arc::new(FakeTransport::new());
        engine.start_with_transport(transport.clone()).await.unwrap();

        let error = engine
            .subscribe(
                &SubscribeRequest::new("Foo", "c1").filter_query("SELECT Id FROM Account"),
                ignore,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::Topic { source: topic::Error::UpdateNotAllowed { .. } }
        ));
        assert_eq!(transport.listener_count("/topic/Foo"), 0);
    }

    #[tokio::test]
    async fn test_start_with_bayeux_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cometd/65.0"))
            .and(wiremock::matchers::body_string_contains("/meta/handshake"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "channel": "/meta/handshake",
                "successful": true,
                "clientId": "abc",
                "version": "1.0"
            }])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cometd/65.0"))
            .and(wiremock::matchers::body_string_contains("/meta/connect"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"channel": "/meta/connect", "successful": true}]))
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cometd/65.0"))
            .and(wiremock::matchers::body_string_contains("/meta/disconnect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "channel": "/meta/disconnect", "successful": true
            }])))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine_for(&server.uri()).await;
        engine.start().await.unwrap();
        assert_eq!(engine.state().unwrap(), EngineState::Connected);
        engine.shutdown().await.unwrap();
    }

    impl Engine {
        fn with_channel_timeout(mut self, timeout: Duration) -> Self {
            self.config.channel_timeout = timeout;
            self
        }

        fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
            self.config.handshake_timeout = timeout;
            self
        }
    }
}
