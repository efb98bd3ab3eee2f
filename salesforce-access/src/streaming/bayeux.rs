//! Bayeux long-polling client for the Streaming API.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::transport::{
    ListenerId, MessageListener, MetaChannel, MetaEvent, MetaListener, PushTransport,
    SubscribeOutcome, TransportError, UnsubscribeOutcome,
};
use super::Config;
use crate::session::SessionManager;

const BAYEUX_VERSION: &str = "1.0";
const LONG_POLLING: &str = "long-polling";

/// Server reconnect advice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Advice {
    #[serde(skip_serializing_if = "Option::is_none")]
    reconnect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

/// Meta message, outbound or reply. Data messages stay raw JSON.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Message {
    channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    minimum_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    supported_connection_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscription: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    successful: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    advice: Option<Advice>,
}

impl Message {
    fn handshake() -> Self {
        Message {
            channel: MetaChannel::Handshake.path().to_string(),
            version: Some(BAYEUX_VERSION.to_string()),
            minimum_version: Some(BAYEUX_VERSION.to_string()),
            supported_connection_types: Some(vec![LONG_POLLING.to_string()]),
            ..Default::default()
        }
    }

    fn connect(client_id: &str) -> Self {
        Message {
            channel: MetaChannel::Connect.path().to_string(),
            client_id: Some(client_id.to_string()),
            connection_type: Some(LONG_POLLING.to_string()),
            ..Default::default()
        }
    }

    fn subscription(meta: MetaChannel, client_id: &str, channel: &str) -> Self {
        Message {
            channel: meta.path().to_string(),
            client_id: Some(client_id.to_string()),
            subscription: Some(channel.to_string()),
            ..Default::default()
        }
    }

    fn disconnect(client_id: &str) -> Self {
        Message {
            channel: MetaChannel::Disconnect.path().to_string(),
            client_id: Some(client_id.to_string()),
            ..Default::default()
        }
    }

    fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    /// `401::...` replies mean the OAuth session is no longer valid.
    fn is_session_expired(&self) -> bool {
        !self.is_successful()
            && self
                .error
                .as_deref()
                .is_some_and(|error| error.starts_with("401"))
    }

    fn to_event(&self, meta: MetaChannel, subscription: Option<&str>) -> MetaEvent {
        MetaEvent {
            channel: meta,
            successful: self.is_successful(),
            subscription: self
                .subscription
                .clone()
                .or_else(|| subscription.map(str::to_string)),
            error: self.error.clone(),
            failure: None,
        }
    }
}

/// What the long-poll loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Connect { after: Duration },
    Handshake { after: Duration },
    Stop,
}

#[derive(Default)]
struct ClientState {
    client_id: Option<String>,
    /// Token sent with the latest request; presented when the server rejects it.
    last_token: Option<String>,
    channels: HashMap<String, Vec<(ListenerId, MessageListener)>>,
    polling: bool,
}

struct Inner {
    session: Arc<SessionManager>,
    http_client: reqwest::Client,
    endpoint: Url,
    reconnect_backoff: Duration,
    state: Mutex<ClientState>,
    meta_listener: RwLock<Option<MetaListener>>,
    message_ids: AtomicU64,
    listener_ids: AtomicU64,
    closed: CancellationToken,
}

/// Bayeux long-polling client authenticated with the shared session.
///
/// Every request carries `Authorization: OAuth <token>` with the session's current
/// token. A `401` (HTTP status or Bayeux error) triggers a session refresh; a
/// re-handshake advised by the server resubscribes every channel that still has
/// listeners. Cookies are kept across requests, as the server pins the client to an
/// instance with them.
///
/// Meta-channel outcomes, including those of reconnects and resubscriptions, are
/// reported to the listener installed with [`PushTransport::set_meta_listener`].
#[derive(Clone)]
pub struct BayeuxClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for BayeuxClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BayeuxClient")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("client_id", &self.client_id())
            .finish()
    }
}

impl BayeuxClient {
    /// Creates a client for `endpoint` with timeouts and backoff from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::HttpClientBuild`] if the HTTP client cannot be built.
    pub fn new(
        session: Arc<SessionManager>,
        endpoint: Url,
        config: &Config,
    ) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| TransportError::HttpClientBuild { source })?;

        Ok(Self::with_http_client(
            session,
            endpoint,
            http_client,
            config.reconnect_backoff,
        ))
    }

    /// Creates a client around a caller-supplied HTTP client.
    ///
    /// The HTTP client should keep cookies and allow requests longer than the server's
    /// long-poll timeout.
    pub fn with_http_client(
        session: Arc<SessionManager>,
        endpoint: Url,
        http_client: reqwest::Client,
        reconnect_backoff: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                http_client,
                endpoint,
                reconnect_backoff,
                state: Mutex::new(ClientState::default()),
                meta_listener: RwLock::new(None),
                message_ids: AtomicU64::new(1),
                listener_ids: AtomicU64::new(1),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Returns the push endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Returns the client id assigned by the last successful handshake.
    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id()
    }
}

#[async_trait]
impl PushTransport for BayeuxClient {
    fn set_meta_listener(&self, listener: MetaListener) {
        match self.inner.meta_listener.write() {
            Ok(mut slot) => *slot = Some(listener),
            Err(_) => warn!("meta listener lock poisoned"),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn handshake(&self) -> Result<(), TransportError> {
        if self.inner.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let reply = self.inner.handshake().await?;
        if reply.is_successful() {
            self.inner.start_polling()?;
        }
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn subscribe(
        &self,
        channel: &str,
        listener: MessageListener,
    ) -> Result<(ListenerId, SubscribeOutcome), TransportError> {
        if self.inner.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let id = ListenerId(self.inner.listener_ids.fetch_add(1, Ordering::Relaxed));
        let first = {
            let mut state = self.inner.state()?;
            let listeners = state.channels.entry(channel.to_string()).or_default();
            listeners.push((id, listener));
            listeners.len() == 1
        };

        if !first {
            debug!(channel, "joined existing subscription");
            return Ok((id, SubscribeOutcome::Joined));
        }
        if let Err(e) = self
            .inner
            .send_subscription(MetaChannel::Subscribe, channel)
            .await
        {
            self.detach(channel, id);
            return Err(e);
        }
        Ok((id, SubscribeOutcome::Requested))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn unsubscribe(
        &self,
        channel: &str,
        listener: ListenerId,
    ) -> Result<UnsubscribeOutcome, TransportError> {
        let last = {
            let mut state = self.inner.state()?;
            let Some(listeners) = state.channels.get_mut(channel) else {
                return Ok(UnsubscribeOutcome::LocalOnly);
            };
            listeners.retain(|(id, _)| *id != listener);
            let last = listeners.is_empty();
            if last {
                state.channels.remove(channel);
            }
            last
        };

        if !last {
            return Ok(UnsubscribeOutcome::LocalOnly);
        }
        self.inner
            .send_subscription(MetaChannel::Unsubscribe, channel)
            .await?;
        Ok(UnsubscribeOutcome::Requested)
    }

    fn detach(&self, channel: &str, listener: ListenerId) {
        let Ok(mut state) = self.inner.state() else {
            return;
        };
        if let Some(listeners) = state.channels.get_mut(channel) {
            listeners.retain(|(id, _)| *id != listener);
            if listeners.is_empty() {
                state.channels.remove(channel);
            }
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.closed.cancel();
        let client_id = {
            let mut state = self.inner.state()?;
            state.channels.clear();
            state.client_id.take()
        };
        let Some(client_id) = client_id else {
            return Ok(());
        };

        match self.inner.exchange(Message::disconnect(&client_id)).await {
            Ok(reply) => {
                self.inner.emit(&reply.to_event(MetaChannel::Disconnect, None));
                info!("push client disconnected");
                Ok(())
            }
            Err(e) => {
                self.inner
                    .emit(&MetaEvent::failed(MetaChannel::Disconnect, e.to_string()));
                Err(e)
            }
        }
    }
}

impl Inner {
    fn state(&self) -> Result<MutexGuard<'_, ClientState>, TransportError> {
        self.state.lock().map_err(|_| TransportError::LockError)
    }

    fn client_id(&self) -> Option<String> {
        self.state.lock().ok().and_then(|state| state.client_id.clone())
    }

    fn emit(&self, event: &MetaEvent) {
        let listener = self
            .meta_listener
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(listener) = listener {
            listener(event);
        }
    }

    /// Delivers a data message to every listener of its channel.
    fn dispatch(&self, message: &Value) {
        let Some(channel) = message.get("channel").and_then(Value::as_str) else {
            warn!("dropping push message without channel");
            return;
        };

        let listeners: Vec<MessageListener> = match self.state.lock() {
            Ok(state) => state
                .channels
                .get(channel)
                .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        if listeners.is_empty() {
            debug!(channel, "no listener for push message");
        }
        for listener in listeners {
            listener(channel, message);
        }
    }

    async fn token(&self) -> Result<String, TransportError> {
        let token = match self.session.current_token().await {
            Some(token) => token,
            None => self
                .session
                .login(None)
                .await
                .map_err(|source| TransportError::Session { source })?,
        };
        self.remember_token(&token);
        Ok(token)
    }

    fn remember_token(&self, token: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.last_token = Some(token.to_string());
        }
    }

    /// Replaces the token the server rejected.
    async fn reauthenticate(&self) -> Result<(), TransportError> {
        let stale = self.state()?.last_token.clone();
        let token = self
            .session
            .login(stale.as_deref())
            .await
            .map_err(|source| TransportError::Session { source })?;
        self.remember_token(&token);
        Ok(())
    }

    /// Posts a message batch, refreshing the session once on HTTP 401.
    async fn post(&self, messages: &[Message]) -> Result<Vec<Value>, TransportError> {
        let mut token = self.token().await?;
        let mut refreshed = false;

        loop {
            let authorization = HeaderValue::from_str(&format!("OAuth {token}"))
                .map_err(|source| TransportError::InvalidHeader { source })?;
            let response = self
                .http_client
                .post(self.endpoint.clone())
                .header(AUTHORIZATION, authorization)
                .json(messages)
                .send()
                .await
                .map_err(|source| TransportError::Network { source })?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                let _ = response.bytes().await;
                debug!("push endpoint rejected the session, refreshing");
                token = self
                    .session
                    .login(Some(&token))
                    .await
                    .map_err(|source| TransportError::Session { source })?;
                self.remember_token(&token);
                refreshed = true;
                continue;
            }

            if !status.is_success() {
                let _ = response.bytes().await;
                return Err(TransportError::Http {
                    status: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
                });
            }

            let body = response
                .bytes()
                .await
                .map_err(|source| TransportError::Network { source })?;
            return serde_json::from_slice(&body)
                .map_err(|e| TransportError::Protocol(format!("invalid message list: {e}")));
        }
    }

    /// Sends one meta message and returns its reply; data messages in the response are
    /// dispatched.
    async fn exchange(&self, mut message: Message) -> Result<Message, TransportError> {
        message.id = Some(self.message_ids.fetch_add(1, Ordering::Relaxed).to_string());
        let channel = message.channel.clone();
        let values = self.post(std::slice::from_ref(&message)).await?;

        let mut reply = None;
        for value in values {
            let is_meta = value
                .get("channel")
                .and_then(Value::as_str)
                .is_some_and(|c| c.starts_with("/meta/"));
            if !is_meta {
                self.dispatch(&value);
                continue;
            }
            let meta: Message = serde_json::from_value(value)
                .map_err(|e| TransportError::Protocol(format!("invalid meta message: {e}")))?;
            if meta.channel == channel && reply.is_none() {
                reply = Some(meta);
            }
        }

        reply.ok_or_else(|| TransportError::Protocol(format!("no reply on {channel}")))
    }

    async fn handshake_once(&self) -> Result<Message, TransportError> {
        self.state()?.client_id = None;
        let reply = self.exchange(Message::handshake()).await?;
        if reply.is_successful() {
            let client_id = reply.client_id.clone().ok_or_else(|| {
                TransportError::Protocol("handshake reply without clientId".to_string())
            })?;
            self.state()?.client_id = Some(client_id);
        }
        Ok(reply)
    }

    /// Handshakes, refreshing the session and retrying once on `401::`. Emits the final
    /// outcome only.
    async fn handshake(&self) -> Result<Message, TransportError> {
        let mut result = self.handshake_once().await;
        if matches!(&result, Ok(reply) if reply.is_session_expired()) {
            debug!("handshake refused with expired session, refreshing");
            result = match self.reauthenticate().await {
                Ok(()) => self.handshake_once().await,
                Err(e) => Err(e),
            };
        }

        match &result {
            Ok(reply) => {
                if reply.is_successful() {
                    info!("push handshake succeeded");
                }
                self.emit(&reply.to_event(MetaChannel::Handshake, None));
            }
            Err(e) => self.emit(&MetaEvent::failed(MetaChannel::Handshake, e.to_string())),
        }
        result
    }

    /// Sends `/meta/subscribe` or `/meta/unsubscribe` for `channel` and reports the outcome.
    async fn send_subscription(
        &self,
        meta: MetaChannel,
        channel: &str,
    ) -> Result<(), TransportError> {
        let client_id = self.client_id().ok_or(TransportError::NotHandshaken)?;
        match self
            .exchange(Message::subscription(meta, &client_id, channel))
            .await
        {
            Ok(reply) => {
                self.emit(&reply.to_event(meta, Some(channel)));
                Ok(())
            }
            Err(e) => {
                self.emit(&MetaEvent::failed(meta, e.to_string()).for_subscription(channel));
                Err(e)
            }
        }
    }

    fn start_polling(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut state = self.state()?;
        if !state.polling {
            state.polling = true;
            tokio::spawn(poll(Arc::clone(self)));
        }
        Ok(())
    }

    async fn connect_once(&self) -> Next {
        let Some(client_id) = self.client_id() else {
            return Next::Handshake {
                after: Duration::ZERO,
            };
        };

        match self.exchange(Message::connect(&client_id)).await {
            Ok(reply) => {
                self.emit(&reply.to_event(MetaChannel::Connect, None));
                self.after_connect(&reply).await
            }
            Err(e) => {
                self.emit(&MetaEvent::failed(MetaChannel::Connect, e.to_string()));
                Next::Connect {
                    after: self.reconnect_backoff,
                }
            }
        }
    }

    async fn after_connect(&self, reply: &Message) -> Next {
        if reply.is_session_expired() {
            if let Err(e) = self.reauthenticate().await {
                warn!(error = %e, "failed to refresh push session");
                return Next::Handshake {
                    after: self.reconnect_backoff,
                };
            }
            return Next::Handshake {
                after: Duration::ZERO,
            };
        }

        let advice = reply.advice.clone().unwrap_or_default();
        let interval = advice.interval.map(Duration::from_millis);
        let pause = if reply.is_successful() {
            Duration::ZERO
        } else {
            self.reconnect_backoff
        };

        match advice.reconnect.as_deref() {
            Some("none") => Next::Stop,
            Some("handshake") => Next::Handshake {
                after: interval.unwrap_or(Duration::ZERO),
            },
            _ => Next::Connect {
                after: interval.unwrap_or(pause),
            },
        }
    }

    async fn rehandshake(&self) -> Next {
        match self.handshake().await {
            Ok(reply) if reply.is_successful() => {
                self.resubscribe().await;
                Next::Connect {
                    after: Duration::ZERO,
                }
            }
            Ok(reply) => match reply.advice.and_then(|a| a.reconnect).as_deref() {
                Some("none") => Next::Stop,
                _ => Next::Handshake {
                    after: self.reconnect_backoff,
                },
            },
            Err(_) => Next::Handshake {
                after: self.reconnect_backoff,
            },
        }
    }

    /// Subscribes again to every channel that still has listeners.
    async fn resubscribe(&self) {
        let channels: Vec<String> = match self.state.lock() {
            Ok(state) => state.channels.keys().cloned().collect(),
            Err(_) => return,
        };
        for channel in channels {
            if let Err(e) = self.send_subscription(MetaChannel::Subscribe, &channel).await {
                warn!(%channel, error = %e, "resubscription failed");
            }
        }
    }
}

/// Long-poll loop; runs until the client is closed or the server advises to stop.
async fn poll(inner: Arc<Inner>) {
    debug!("long-poll loop started");
    let mut next = Next::Connect {
        after: Duration::ZERO,
    };

    loop {
        let (after, handshake) = match next {
            Next::Connect { after } => (after, false),
            Next::Handshake { after } => (after, true),
            Next::Stop => {
                warn!("server advised not to reconnect");
                break;
            }
        };

        if !after.is_zero() {
            tokio::select! {
                _ = inner.closed.cancelled() => break,
                _ = tokio::time::sleep(after) => {}
            }
        }

        next = tokio::select! {
            _ = inner.closed.cancelled() => break,
            next = async {
                if handshake {
                    inner.rehandshake().await
                } else {
                    inner.connect_once().await
                }
            } => next,
        };
    }

    if let Ok(mut state) = inner.state.lock() {
        state.polling = false;
    }
    debug!("long-poll loop stopped");
}
