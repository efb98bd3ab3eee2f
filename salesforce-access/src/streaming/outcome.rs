//! Meta-channel outcome tracking with race-free waits.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::transport::{MetaChannel, MetaEvent};

/// Handshake progress as reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    #[default]
    Pending,
    Succeeded,
    Failed {
        error: Option<String>,
        failure: Option<String>,
    },
}

/// Channel outcomes recorded from meta-channel callbacks.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelOutcomeState {
    pub(crate) confirmed: HashSet<String>,
    pub(crate) subscribe_errors: HashMap<String, String>,
    pub(crate) unsubscribe_errors: HashMap<String, String>,
    /// Number of subscribe outcomes seen per channel.
    pub(crate) subscribe_seen: HashMap<String, u64>,
    /// Number of unsubscribe outcomes seen per channel.
    pub(crate) unsubscribe_seen: HashMap<String, u64>,
    pub(crate) handshake: HandshakeState,
    pub(crate) connected: bool,
}

/// Result of a bounded wait.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Wait<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

/// Server-side handshake refusal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HandshakeFailure {
    pub(crate) error: Option<String>,
    pub(crate) failure: Option<String>,
}

/// Shared outcome state. The meta listener is the only writer; callers wait on changes
/// instead of polling, so an outcome recorded before the wait starts is still seen.
#[derive(Debug)]
pub(crate) struct ChannelOutcomes {
    state: watch::Sender<ChannelOutcomeState>,
}

impl ChannelOutcomes {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ChannelOutcomeState::default());
        Self { state }
    }

    /// Applies one meta-channel outcome.
    pub(crate) fn record(&self, event: &MetaEvent) {
        self.state.send_modify(|state| match event.channel {
            MetaChannel::Handshake => {
                if event.successful {
                    debug!("handshake succeeded");
                    state.handshake = HandshakeState::Succeeded;
                } else {
                    warn!(reason = %event.reason(), "handshake failed");
                    state.handshake = HandshakeState::Failed {
                        error: event.error.clone(),
                        failure: event.failure.clone(),
                    };
                    state.connected = false;
                }
            }
            MetaChannel::Connect => {
                if event.successful {
                    state.connected = true;
                } else {
                    warn!(reason = %event.reason(), "connect failed, transport will retry");
                }
            }
            MetaChannel::Subscribe => {
                let Some(channel) = event.subscription.clone() else {
                    warn!("subscribe outcome without subscription");
                    return;
                };
                *state.subscribe_seen.entry(channel.clone()).or_default() += 1;
                if event.successful {
                    debug!(%channel, "subscription confirmed");
                    state.subscribe_errors.remove(&channel);
                    state.confirmed.insert(channel);
                } else {
                    warn!(%channel, reason = %event.reason(), "subscription failed");
                    state.subscribe_errors.insert(channel, event.reason());
                }
            }
            MetaChannel::Unsubscribe => {
                let Some(channel) = event.subscription.clone() else {
                    warn!("unsubscribe outcome without subscription");
                    return;
                };
                *state.unsubscribe_seen.entry(channel.clone()).or_default() += 1;
                if event.successful {
                    debug!(%channel, "unsubscription confirmed");
                    state.unsubscribe_errors.remove(&channel);
                    state.confirmed.remove(&channel);
                } else {
                    warn!(%channel, reason = %event.reason(), "unsubscription failed");
                    state.unsubscribe_errors.insert(channel, event.reason());
                }
            }
            MetaChannel::Disconnect => {
                debug!(successful = event.successful, "disconnected");
                state.connected = false;
            }
        });
    }

    /// Forgets the previous handshake before a new one starts.
    pub(crate) fn begin_handshake(&self) {
        self.state.send_modify(|state| {
            state.handshake = HandshakeState::Pending;
            state.connected = false;
        });
    }

    /// Returns a mark for `channel`; waits given this mark ignore subscribe outcomes
    /// recorded before it was taken.
    pub(crate) fn subscribe_mark(&self, channel: &str) -> u64 {
        self.state.borrow().subscribe_seen.get(channel).copied().unwrap_or(0)
    }

    /// Returns a mark for `channel`; waits given this mark ignore unsubscribe outcomes
    /// recorded before it was taken.
    pub(crate) fn unsubscribe_mark(&self, channel: &str) -> u64 {
        self.state.borrow().unsubscribe_seen.get(channel).copied().unwrap_or(0)
    }

    /// Returns the currently confirmed channels.
    pub(crate) fn confirmed(&self) -> HashSet<String> {
        self.state.borrow().confirmed.clone()
    }

    /// Waits until a connect succeeds after the handshake, or the handshake is refused.
    pub(crate) async fn wait_connected(
        &self,
        bound: Duration,
        cancel: &CancellationToken,
    ) -> Wait<Result<(), HandshakeFailure>> {
        self.wait_until(bound, cancel, |state| {
            if state.connected {
                return Some(Ok(()));
            }
            match &state.handshake {
                HandshakeState::Failed { error, failure } => Some(Err(HandshakeFailure {
                    error: error.clone(),
                    failure: failure.clone(),
                })),
                _ => None,
            }
        })
        .await
    }

    /// Waits until `channel` is confirmed or its subscription is refused.
    ///
    /// With `since`, only an outcome recorded after that mark settles the wait. Without
    /// it, an existing confirmation is accepted, which is what a listener joining an
    /// already subscribed channel needs.
    pub(crate) async fn wait_subscribed(
        &self,
        channel: &str,
        since: Option<u64>,
        bound: Duration,
        cancel: &CancellationToken,
    ) -> Wait<Result<(), String>> {
        self.wait_until(bound, cancel, |state| {
            if let Some(mark) = since {
                if state.subscribe_seen.get(channel).copied().unwrap_or(0) <= mark {
                    return None;
                }
            }
            if let Some(reason) = state.subscribe_errors.get(channel) {
                Some(Err(reason.clone()))
            } else if state.confirmed.contains(channel) {
                Some(Ok(()))
            } else {
                None
            }
        })
        .await
    }

    /// Waits for an unsubscribe outcome on `channel` recorded after `since`.
    pub(crate) async fn wait_unsubscribed(
        &self,
        channel: &str,
        since: u64,
        bound: Duration,
        cancel: &CancellationToken,
    ) -> Wait<Result<(), String>> {
        self.wait_until(bound, cancel, |state| {
            if state.unsubscribe_seen.get(channel).copied().unwrap_or(0) <= since {
                return None;
            }
            match state.unsubscribe_errors.get(channel) {
                Some(reason) => Some(Err(reason.clone())),
                None => Some(Ok(())),
            }
        })
        .await
    }

    async fn wait_until<T, F>(
        &self,
        bound: Duration,
        cancel: &CancellationToken,
        decide: F,
    ) -> Wait<T>
    where
        F: Fn(&ChannelOutcomeState) -> Option<T>,
    {
        let mut receiver = self.state.subscribe();
        let waiting = async {
            let state = receiver.wait_for(|state| decide(state).is_some()).await.ok()?;
            decide(&state)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Wait::Cancelled,
            result = tokio::time::timeout(bound, waiting) => match result {
                Ok(Some(outcome)) => Wait::Done(outcome),
                // The sender lives as long as `self`; treat a closed channel as shutdown.
                Ok(None) => Wait::Cancelled,
                Err(_) => Wait::TimedOut,
            },
        }
    }
}
