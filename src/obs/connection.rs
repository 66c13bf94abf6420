//! OBS Connection protocol FSM (§4.2).
//!
//! States: `disconnected -> connecting -> authenticating -> ready`, with any state able to fall
//! back to `disconnected` on loss. Drives the handshake over a [`crate::transport::Transport`],
//! tracks in-flight requests via [`RequestTracker`], and republishes decoded events on the bus.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::obs::auth::auth_response;
use crate::obs::protocol::{ClientMessage, EventFrame, EventSubscription, Identify, Request, ServerMessage};
use crate::obs::request_tracker::{spawn_request_timeout, RequestOutcome, RequestTracker, DEFAULT_TIMEOUT};
use crate::pubsub::{topics, Bus};
use crate::transport::{Transport, TransportEvent, TransportOptions};

/// Default deadline for the `Hello`/`Identify`/`Identified` handshake (§5).
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle state (§3 "Session (OBS)").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Socket open, waiting for `Hello`.
    Connecting,
    /// `Hello` received, `Identify` sent, waiting for `Identified`.
    Authenticating,
    /// Identified; requests may be dispatched.
    Ready,
    /// Lost a `Ready` connection and is retrying.
    Reconnecting,
}

/// Errors surfaced by the OBS connection FSM.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The server requires authentication but no password was configured.
    #[error("authentication required but no password configured")]
    AuthRequiredNoPassword,
    /// The handshake did not complete within [`AUTH_TIMEOUT`].
    #[error("authentication timed out")]
    AuthTimeout,
    /// Transport reported a fatal close code (§4.2 "Close-code policy").
    #[error("fatal close code {0}")]
    FatalClose(u16),
    /// A request was submitted but the connection was torn down before a response arrived.
    #[error("request expired across reconnect")]
    RequestExpired,
    /// The request tracker resolved with a non-success status.
    #[error("request failed: {0:?}")]
    RequestFailed(crate::obs::protocol::RequestStatus),
    /// The request timed out waiting for a response.
    #[error("request timed out")]
    RequestTimeout,
    /// Transport-level error (disconnect, send failure, etc).
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
}

impl Error {
    /// Bucket this error for dashboard-facing reporting (§7).
    #[must_use]
    pub fn kind(&self) -> crate::error::ErrorKind {
        use crate::error::ErrorKind;
        match self {
            Self::AuthRequiredNoPassword => ErrorKind::Auth,
            Self::AuthTimeout | Self::FatalClose(_) => ErrorKind::ProtocolFatal,
            Self::RequestExpired | Self::RequestFailed(_) | Self::RequestTimeout => ErrorKind::Application,
            Self::Transport(_) => ErrorKind::Transient,
        }
    }
}

/// A queued request, waiting for the connection to reach `Ready`.
struct QueuedRequest {
    request_type: String,
    request_data: serde_json::Value,
    waiter: oneshot::Sender<Result<serde_json::Value, Error>>,
    timeout: Duration,
}

/// One OBS session's connection FSM.
pub struct Connection {
    session_id: String,
    password: Option<String>,
    state: Arc<RwLock<ConnectionState>>,
    rpc_version: Arc<RwLock<Option<u32>>>,
    tracker: Arc<RequestTracker>,
    pending: Arc<Mutex<VecDeque<QueuedRequest>>>,
    transport: Arc<RwLock<Option<Transport>>>,
    bus: Bus,
    error_gate: Arc<Mutex<ErrorLogGate>>,
    fatal_tx: Arc<Mutex<Option<oneshot::Sender<Error>>>>,
}

/// Suppresses repeated WARN-level logging of transport errors (§4.2): the first 5 consecutive
/// errors log at WARNING, later ones are counted silently until the next successful connect.
#[derive(Default)]
struct ErrorLogGate {
    consecutive: u32,
}

impl ErrorLogGate {
    fn note_error(&mut self, reason: &str) {
        self.consecutive += 1;
        if self.consecutive <= 5 {
            warn!(reason, consecutive = self.consecutive, "obs transport error");
        } else {
            debug!(reason, consecutive = self.consecutive, "obs transport error (suppressed)");
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

impl Connection {
    /// Start a new connection task. Returns the handle immediately; connect/handshake/reconnect
    /// all happen on a spawned background task, and a fatal protocol error (if any) can be
    /// awaited via the returned receiver.
    #[must_use]
    pub fn start(
        session_id: String,
        uri: String,
        password: Option<String>,
        bus: Bus,
        metrics: Arc<dyn Metrics>,
        reconnect_base_delay: Duration,
    ) -> (Arc<Self>, oneshot::Receiver<Error>) {
        let (fatal_tx, fatal_rx) = oneshot::channel();
        let connection = Arc::new(Self {
            session_id,
            password,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            rpc_version: Arc::new(RwLock::new(None)),
            tracker: Arc::new(RequestTracker::new(metrics)),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            transport: Arc::new(RwLock::new(None)),
            bus,
            error_gate: Arc::new(Mutex::new(ErrorLogGate::default())),
            fatal_tx: Arc::new(Mutex::new(Some(fatal_tx))),
        });

        let worker = connection.clone();
        tokio::spawn(async move { worker.run(uri, reconnect_base_delay).await });

        (connection, fatal_rx)
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn run(self: Arc<Self>, uri: String, reconnect_base_delay: Duration) {
        let mut options = TransportOptions::default();
        options.reconnect.base = reconnect_base_delay;
        let (transport, mut events) = Transport::open(uri, options);
        *self.transport.write().await = Some(transport);

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connecting => {
                    *self.state.write().await = ConnectionState::Connecting;
                }
                TransportEvent::Connected => {
                    self.error_gate.lock().await.reset();
                    *self.state.write().await = ConnectionState::Authenticating;
                    self.spawn_auth_watchdog();
                }
                TransportEvent::Frame { text } => {
                    self.on_frame(&text).await;
                }
                TransportEvent::Disconnected { code, reason } => {
                    warn!(?code, %reason, "obs connection lost");
                    *self.state.write().await = ConnectionState::Reconnecting;
                    self.rpc_version.write().await.take();
                    self.tracker.cancel_all().await;
                    self.expire_pending().await;

                    if let Some(code) = code {
                        if crate::obs::protocol::is_fatal_close_code(code) {
                            self.report_fatal(Error::FatalClose(code)).await;
                            return;
                        }
                    }
                }
                TransportEvent::Error { reason } => {
                    self.error_gate.lock().await.note_error(&reason);
                }
            }
        }
    }

    /// Forces a reconnect if the handshake has not reached `Ready` within [`AUTH_TIMEOUT`]
    /// (§5 "Authentication has a 10 s deadline; expiry forces reconnect").
    fn spawn_auth_watchdog(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(AUTH_TIMEOUT).await;
            if *this.state.read().await == ConnectionState::Authenticating {
                warn!(session = %this.session_id, "obs auth timed out; forcing reconnect");
                if let Some(transport) = this.transport.read().await.as_ref() {
                    transport.disconnect().await;
                }
            }
        });
    }

    async fn on_frame(self: &Arc<Self>, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, raw = %crate::error::truncate_for_log(text), "malformed obs frame");
                return;
            }
        };

        match message {
            ServerMessage::Hello(hello) => {
                self.rpc_version.write().await.replace(hello.rpc_version);

                let authentication = match hello.authentication {
                    Some(auth) => match self.password.as_deref() {
                        Some(pw) => Some(auth_response(pw, &auth.salt, &auth.challenge)),
                        None => {
                            self.report_fatal(Error::AuthRequiredNoPassword).await;
                            return;
                        }
                    },
                    None => None,
                };

                let identify = Identify {
                    rpc_version: hello.rpc_version,
                    authentication,
                    event_subscriptions: EventSubscription::ALL_NONVOLATILE,
                };
                self.send_raw(ClientMessage::Identify(identify)).await;
            }
            ServerMessage::Identified(identified) => {
                self.rpc_version.write().await.replace(identified.negotiated_rpc_version);
                *self.state.write().await = ConnectionState::Ready;
                info!(session = %self.session_id, rpc_version = identified.negotiated_rpc_version, "obs identified");
                self.flush_pending().await;
            }
            ServerMessage::Event(event) => {
                self.publish_event(event).await;
            }
            ServerMessage::RequestResponse(response) => {
                self.tracker.complete(response).await;
            }
            ServerMessage::Other { op } => {
                debug!(op, "unhandled obs opcode");
            }
        }
    }

    async fn publish_event(&self, event: EventFrame) {
        let payload = serde_json::json!({
            "sessionId": self.session_id,
            "eventType": event.event_type,
            "eventData": event.event_data,
        });
        self.bus
            .publish(topics::OBS_EVENTS, payload.clone())
            .await;
        self.bus
            .publish(topics::obs_session_events(&self.session_id), payload.clone())
            .await;
        self.bus
            .publish(
                topics::obs_session_event_type(&self.session_id, &event.event_type),
                payload,
            )
            .await;
    }

    async fn send_raw(&self, message: ClientMessage<'_>) {
        let Ok(text) = serde_json::to_string(&message) else {
            warn!("failed to serialize outbound obs message");
            return;
        };
        if let Some(transport) = self.transport.read().await.as_ref() {
            if let Err(e) = transport.send(text).await {
                warn!(error = %e, "failed to send obs message");
            }
        }
    }

    /// Submit a request. Accepted in any state (§3); dispatched immediately if `Ready`, otherwise
    /// queued FIFO until the connection becomes `Ready`.
    pub async fn send_request(self: &Arc<Self>, request_type: &str, data: serde_json::Value) -> Result<serde_json::Value, Error> {
        self.send_request_with_timeout(request_type, data, DEFAULT_TIMEOUT).await
    }

    /// Same as [`Self::send_request`] with an explicit deadline.
    pub async fn send_request_with_timeout(
        self: &Arc<Self>,
        request_type: &str,
        data: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, Error> {
        if *self.state.read().await == ConnectionState::Ready {
            self.dispatch(request_type, data, timeout).await
        } else {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.push_back(QueuedRequest {
                request_type: request_type.to_owned(),
                request_data: data,
                waiter: tx,
                timeout,
            });
            rx.await.unwrap_or(Err(Error::RequestExpired))
        }
    }

    async fn dispatch(self: &Arc<Self>, request_type: &str, data: serde_json::Value, timeout: Duration) -> Result<serde_json::Value, Error> {
        let (id, rx) = self.tracker.track(request_type, timeout).await;
        let request_id = id.to_string();
        spawn_request_timeout(self.tracker.clone(), id, timeout);

        self.send_raw(ClientMessage::Request(Request {
            request_id: &request_id,
            request_type,
            request_data: data,
        }))
        .await;

        match rx.await {
            Ok(RequestOutcome::Success(data)) => Ok(data),
            Ok(RequestOutcome::Failed(status)) => Err(Error::RequestFailed(status)),
            Ok(RequestOutcome::Timeout) => Err(Error::RequestTimeout),
            Ok(RequestOutcome::Cancelled) | Err(_) => Err(Error::RequestExpired),
        }
    }

    async fn flush_pending(self: &Arc<Self>) {
        let mut queue = self.pending.lock().await;
        let drained: Vec<_> = queue.drain(..).collect();
        drop(queue);

        for item in drained {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let result = this.dispatch(&item.request_type, item.request_data, item.timeout).await;
                let _ = item.waiter.send(result);
            });
        }
    }

    /// §4.2 "If a request is still queued when the session re-establishes after a disconnect, it
    /// is failed with `request_expired`".
    async fn expire_pending(&self) {
        let mut queue = self.pending.lock().await;
        for item in queue.drain(..) {
            let _ = item.waiter.send(Err(Error::RequestExpired));
        }
    }

    async fn report_fatal(&self, error: Error) {
        *self.state.write().await = ConnectionState::Disconnected;
        if let Some(transport) = self.transport.read().await.as_ref() {
            transport.disconnect().await;
        }
        if let Some(tx) = self.fatal_tx.lock().await.take() {
            let _ = tx.send(error);
        }
    }

    /// Gracefully stop the connection. Does not trigger the owner's restart policy.
    pub async fn stop(&self) {
        if let Some(transport) = self.transport.read().await.as_ref() {
            transport.disconnect().await;
        }
        self.tracker.cancel_all().await;
        self.expire_pending().await;
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_transitions_are_distinct() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Ready);
    }
}
