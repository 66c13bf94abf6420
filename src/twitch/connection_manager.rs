//! Twitch EventSub WebSocket connection manager (§4.6).
//!
//! States: `disconnected -> connecting -> connected -> ready`, the last transition gated on
//! observing `session_welcome`. A keepalive watchdog forces a reconnect if too long passes
//! between frames; `session_reconnect` hot-swaps the socket without ever tearing down
//! subscriptions, since Twitch migrates them server-side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::twitch::message_router::{route, RouterAction};
use crate::twitch::protocol::Envelope;
use crate::transport::{Transport, TransportEvent, TransportOptions};

const EVENTSUB_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_WELCOME_DEADLINE: Duration = Duration::from_secs(10);
const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Connection lifecycle state (§4.6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Socket open, waiting for the upgrade to complete.
    Connecting,
    /// Socket open, waiting for `session_welcome`.
    Connected,
    /// `session_welcome` observed; subscriptions may be created.
    Ready,
}

/// Events the connection manager hands to its owner (a `twitch::SessionManager`).
#[derive(Debug, Clone)]
pub enum TwitchEvent {
    /// A new session was established (first connect, or a forced keepalive reconnect).
    SessionWelcome {
        /// New session id.
        session_id: String,
    },
    /// An EventSub notification arrived.
    Notification {
        /// EventSub subscription type, e.g. `channel.follow`.
        subscription_type: String,
        /// Raw event body.
        event: serde_json::Value,
    },
    /// A subscription was revoked.
    Revocation {
        /// Revoked subscription id.
        subscription_id: String,
        /// Revocation reason.
        reason: String,
    },
    /// The socket was lost and a fresh session will follow once reconnected.
    Disconnected,
}

/// Drives one logical EventSub WebSocket connection, including the `session_reconnect` hot-swap.
pub struct ConnectionManager {
    client_id: String,
    reconnect_base_delay: Duration,
    state: Arc<RwLock<ConnectionState>>,
    transport: Arc<RwLock<Option<Transport>>>,
    last_frame: Arc<RwLock<Instant>>,
    keepalive_timeout: Arc<RwLock<Duration>>,
    swapping: AtomicBool,
    out: mpsc::Sender<TwitchEvent>,
}

impl ConnectionManager {
    /// Connect to the EventSub WebSocket and start routing frames. Returns the manager and a
    /// channel of [`TwitchEvent`]s for the owner to consume. `reconnect_base_delay` seeds the
    /// transport's backoff policy (§6 `reconnect_interval_ms`).
    #[must_use]
    pub fn start(client_id: String, reconnect_base_delay: Duration) -> (Arc<Self>, mpsc::Receiver<TwitchEvent>) {
        let (out_tx, out_rx) = mpsc::channel(256);
        let manager = Arc::new(Self {
            client_id,
            reconnect_base_delay,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            transport: Arc::new(RwLock::new(None)),
            last_frame: Arc::new(RwLock::new(Instant::now())),
            keepalive_timeout: Arc::new(RwLock::new(DEFAULT_KEEPALIVE_TIMEOUT)),
            swapping: AtomicBool::new(false),
            out: out_tx,
        });

        let worker = manager.clone();
        tokio::spawn(async move { worker.run(EVENTSUB_URL.to_owned()).await });

        let watchdog = manager.clone();
        tokio::spawn(async move { watchdog.run_watchdog().await });

        (manager, out_rx)
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn run(self: Arc<Self>, uri: String) {
        let options = self.transport_options();
        let (transport, mut events) = Transport::open(uri, options);
        *self.transport.write().await = Some(transport);

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connecting => {
                    *self.state.write().await = ConnectionState::Connecting;
                }
                TransportEvent::Connected => {
                    *self.state.write().await = ConnectionState::Connected;
                    *self.last_frame.write().await = Instant::now();
                }
                TransportEvent::Frame { text } => {
                    self.on_frame(&text).await;
                }
                TransportEvent::Disconnected { code, reason } => {
                    warn!(?code, %reason, "twitch connection lost");
                    *self.state.write().await = ConnectionState::Disconnected;
                    let _ = self.out.send(TwitchEvent::Disconnected).await;
                }
                TransportEvent::Error { reason } => {
                    debug!(reason, "twitch transport error");
                }
            }
        }
    }

    async fn on_frame(self: &Arc<Self>, text: &str) {
        *self.last_frame.write().await = Instant::now();

        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, raw = %crate::error::truncate_for_log(text), "malformed twitch frame");
                return;
            }
        };

        match route(&envelope) {
            RouterAction::SessionWelcome { session_id, keepalive_timeout_seconds } => {
                *self.state.write().await = ConnectionState::Ready;
                *self.keepalive_timeout.write().await = Duration::from_secs(keepalive_timeout_seconds);
                info!(session_id = %session_id, keepalive_timeout_seconds, "twitch session welcome");
                let _ = self.out.send(TwitchEvent::SessionWelcome { session_id }).await;
            }
            RouterAction::Keepalive => {}
            RouterAction::Reconnect { reconnect_url } => {
                self.clone().hot_swap(reconnect_url).await;
            }
            RouterAction::Notification { subscription_type, event } => {
                let _ = self.out.send(TwitchEvent::Notification { subscription_type, event }).await;
            }
            RouterAction::Revocation { subscription_id, reason } => {
                warn!(subscription_id = %subscription_id, reason = %reason, "twitch subscription revoked");
                let _ = self.out.send(TwitchEvent::Revocation { subscription_id, reason }).await;
            }
            RouterAction::Unknown { message_type } => {
                debug!(message_type, "unhandled twitch message type");
            }
        }
    }

    /// `session_reconnect`: connect the replacement socket, wait for its own `session_welcome`,
    /// then swap it in and close the old one. Subscriptions are migrated by Twitch; no
    /// `TwitchEvent` is emitted for the swap itself so the session manager never resets its
    /// subscription bookkeeping on a migration (§9 Open Question 1).
    async fn hot_swap(self: Arc<Self>, reconnect_url: String) {
        if self.swapping.swap(true, Ordering::AcqRel) {
            debug!("hot swap already in progress; ignoring duplicate session_reconnect");
            return;
        }

        info!(url = %reconnect_url, "hot-swapping twitch connection for session_reconnect");
        let options = self.transport_options();
        let (new_transport, mut new_events) = Transport::open(reconnect_url, options);

        let welcomed = tokio::time::timeout(RECONNECT_WELCOME_DEADLINE, async {
            while let Some(event) = new_events.recv().await {
                if let TransportEvent::Frame { text } = event {
                    if let Ok(envelope) = serde_json::from_str::<Envelope>(&text) {
                        if matches!(route(&envelope), RouterAction::SessionWelcome { .. }) {
                            return true;
                        }
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if !welcomed {
            warn!("session_reconnect target never sent session_welcome; keeping old connection");
            new_transport.disconnect().await;
            self.swapping.store(false, Ordering::Release);
            return;
        }

        let old = self.transport.write().await.replace(new_transport);
        if let Some(old) = old {
            old.disconnect().await;
        }
        *self.last_frame.write().await = Instant::now();

        let forwarder = self.clone();
        tokio::spawn(async move {
            while let Some(event) = new_events.recv().await {
                match event {
                    TransportEvent::Frame { text } => forwarder.on_frame(&text).await,
                    TransportEvent::Disconnected { code, reason } => {
                        warn!(?code, %reason, "twitch connection lost (post-swap)");
                        *forwarder.state.write().await = ConnectionState::Disconnected;
                        let _ = forwarder.out.send(TwitchEvent::Disconnected).await;
                    }
                    _ => {}
                }
            }
        });

        self.swapping.store(false, Ordering::Release);
    }

    async fn run_watchdog(self: Arc<Self>) {
        loop {
            tokio::time::sleep(WATCHDOG_POLL_INTERVAL).await;
            let timeout = *self.keepalive_timeout.read().await;
            let elapsed = self.last_frame.read().await.elapsed();
            if *self.state.read().await == ConnectionState::Disconnected {
                continue;
            }
            if elapsed > timeout {
                warn!(?elapsed, ?timeout, "twitch keepalive timed out; forcing reconnect");
                if let Some(transport) = self.transport.read().await.as_ref() {
                    transport.disconnect().await;
                }
                *self.last_frame.write().await = Instant::now();
            }
        }
    }

    fn transport_options(&self) -> TransportOptions {
        let mut options = TransportOptions::default();
        options.headers.push(("Client-Id".to_owned(), self.client_id.clone()));
        // Twitch drives keepalive via its own session_keepalive cadence; the generic
        // transport-level heartbeat would just add redundant pings.
        options.heartbeat_interval = None;
        options.reconnect.base = self.reconnect_base_delay;
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_in_a_pre_ready_state() {
        let (manager, _rx) = ConnectionManager::start("client".to_owned(), Duration::from_secs(1));
        assert_ne!(manager.state().await, ConnectionState::Ready);
    }
}
