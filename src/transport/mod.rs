//! Generic WebSocket transport wrapper (§4.1), independent of any application protocol.
//!
//! Owns TCP/TLS + WebSocket framing + connection lifecycle: jittered exponential backoff on
//! reconnect, a CloudFront-aware retry path for the initial upgrade, a circuit breaker, and an
//! optional heartbeat. Transport errors never crash the owner — they surface as
//! [`TransportEvent::Disconnected`] / [`TransportEvent::Error`] and the owner drives
//! application-level reconnection policy on top.

mod backoff;
mod circuit_breaker;

pub use backoff::ReconnectPolicy;
pub use circuit_breaker::CircuitBreaker;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};

/// Options controlling one logical connection's lifecycle.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// Extra headers to send during the WebSocket upgrade (e.g. `client-id` for Twitch).
    pub headers: Vec<(String, String)>,
    /// Interval between heartbeat pings. `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// Reconnect backoff policy.
    pub reconnect: ReconnectPolicy,
    /// Maximum CloudFront-style upgrade retries (do not count against reconnect backoff).
    pub max_upgrade_retries: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            heartbeat_interval: Some(Duration::from_secs(20)),
            reconnect: ReconnectPolicy::default(),
            max_upgrade_retries: 3,
        }
    }
}

/// Events delivered to the owner of a transport handle.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A connection attempt has started.
    Connecting,
    /// The WebSocket upgrade succeeded.
    Connected,
    /// A complete text frame arrived.
    Frame {
        /// Decoded text payload.
        text: String,
    },
    /// The connection was closed, gracefully or otherwise.
    Disconnected {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Human-readable reason.
        reason: String,
    },
    /// A non-fatal transport error occurred (e.g. a single bad frame).
    Error {
        /// Description of the error.
        reason: String,
    },
}

/// Errors returned directly by [`Transport`] calls (as opposed to delivered as events).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `send` was called while the socket was not connected.
    #[error("not connected")]
    NotConnected,
    /// The circuit breaker is open; new connection attempts are suspended.
    #[error("circuit open until {0:?}")]
    CircuitOpen(std::time::Instant),
}

/// Handle to a single logical WebSocket connection.
///
/// `Transport` drives one socket at a time on a background task owned by this handle; callers
/// interact with it only through [`Transport::send`] and [`Transport::disconnect`], plus the
/// `TransportEvent` stream supplied to [`Transport::open`].
pub struct Transport {
    outbound: mpsc::Sender<OutboundCommand>,
    connected: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

enum OutboundCommand {
    Send(String),
    Disconnect,
}

impl Transport {
    /// Open a connection to `uri`, spawning a background task that owns the socket and drives
    /// reconnection. Events are delivered on the returned channel until [`Transport::disconnect`]
    /// is called or the handle is dropped.
    #[must_use]
    pub fn open(uri: String, options: TransportOptions) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(128);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let connected = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        tokio::spawn(run(uri, options, event_tx, cmd_rx, connected.clone()));

        (
            Self {
                outbound: cmd_tx,
                connected,
            },
            event_rx,
        )
    }

    /// Enqueue a text frame for sending. Fails with [`Error::NotConnected`] if the socket is not
    /// currently open (the caller decides whether to queue at a higher layer, per §4.2).
    pub async fn send(&self, frame: String) -> Result<(), Error> {
        if !self.connected.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        self.outbound
            .send(OutboundCommand::Send(frame))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Whether the transport currently believes it has an open socket.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Gracefully close the connection and stop reconnecting. Idempotent.
    pub async fn disconnect(&self) {
        let _ = self.outbound.send(OutboundCommand::Disconnect).await;
    }
}

async fn run(
    uri: String,
    options: TransportOptions,
    events: mpsc::Sender<TransportEvent>,
    mut commands: mpsc::Receiver<OutboundCommand>,
    connected: std::sync::Arc<std::sync::atomic::AtomicBool>,
) {
    let mut breaker = CircuitBreaker::new(options.reconnect.circuit_breaker_threshold, options.reconnect.circuit_breaker_timeout);
    let mut attempt: u32 = 0;

    'reconnect: loop {
        if let Some(until) = breaker.open_until() {
            warn!(?until, "circuit open; suspending reconnect");
            let _ = events
                .send(TransportEvent::Error {
                    reason: "circuit open".to_owned(),
                })
                .await;
            tokio::time::sleep(until.saturating_duration_since(std::time::Instant::now())).await;
        }

        if events.send(TransportEvent::Connecting).await.is_err() {
            return;
        }

        let connect_result = connect_with_upgrade_retries(&uri, &options).await;
        let ws_stream = match connect_result {
            Ok(stream) => stream,
            Err(reason) => {
                breaker.record_failure();
                let _ = events.send(TransportEvent::Error { reason }).await;
                attempt += 1;
                tokio::time::sleep(options.reconnect.next_delay(attempt)).await;
                continue 'reconnect;
            }
        };

        breaker.record_success();
        attempt = 0;
        connected.store(true, std::sync::atomic::Ordering::Release);
        if events.send(TransportEvent::Connected).await.is_err() {
            return;
        }

        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat = options.heartbeat_interval.map(tokio::time::interval);
        let mut awaiting_pong = false;

        let disconnect_reason = loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(OutboundCommand::Send(text)) => {
                            if let Err(e) = write.send(WsMessage::Text(text)).await {
                                break (None, format!("send failed: {e}"));
                            }
                        }
                        Some(OutboundCommand::Disconnect) | None => {
                            let _ = write.send(WsMessage::Close(None)).await;
                            connected.store(false, std::sync::atomic::Ordering::Release);
                            return;
                        }
                    }
                }
                Some(tick) = maybe_tick(&mut heartbeat) => {
                    let _ = tick;
                    if awaiting_pong {
                        break (None, "missed heartbeat pong".to_owned());
                    }
                    if write.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break (None, "heartbeat send failed".to_owned());
                    }
                    awaiting_pong = true;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if text.is_empty() {
                                trace!("zero-length text frame; no state change");
                                continue;
                            }
                            if events.send(TransportEvent::Frame { text }).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(WsMessage::Pong(_))) => {
                            awaiting_pong = false;
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = write.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                            break (code, reason);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break (None, format!("read error: {e}")),
                        None => break (None, "stream ended".to_owned()),
                    }
                }
            }
        };

        connected.store(false, std::sync::atomic::Ordering::Release);
        let (code, reason) = disconnect_reason;
        debug!(?code, %reason, "transport disconnected");
        let _ = events
            .send(TransportEvent::Disconnected { code, reason })
            .await;

        attempt += 1;
        tokio::time::sleep(options.reconnect.next_delay(attempt)).await;
    }
}

async fn maybe_tick(interval: &mut Option<tokio::time::Interval>) -> Option<tokio::time::Instant> {
    match interval {
        Some(interval) => Some(interval.tick().await),
        None => std::future::pending().await,
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Build the upgrade request, attaching any extra headers the caller configured (e.g. Twitch's
/// required `Client-Id`). Header names/values come from our own config, never untrusted input, so
/// a malformed one is a programming error, not a runtime condition to recover from.
fn build_request(
    uri: &str,
    options: &TransportOptions,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, tokio_tungstenite::tungstenite::Error> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = uri.into_client_request()?;
    for (name, value) in &options.headers {
        request.headers_mut().insert(
            tokio_tungstenite::tungstenite::http::HeaderName::try_from(name.as_str()).expect("valid header name"),
            tokio_tungstenite::tungstenite::http::HeaderValue::try_from(value.as_str()).expect("valid header value"),
        );
    }
    Ok(request)
}

async fn connect_with_upgrade_retries(uri: &str, options: &TransportOptions) -> Result<WsStream, String> {
    let mut attempts = 0;
    loop {
        let request = build_request(uri, options).map_err(|e| e.to_string())?;
        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _response)) => return Ok(stream),
            Err(e) => {
                let is_cloudfront_400 = matches!(
                    &e,
                    tokio_tungstenite::tungstenite::Error::Http(resp) if resp.status().as_u16() == 400
                );
                attempts += 1;
                if !is_cloudfront_400 || attempts > options.max_upgrade_retries {
                    return Err(e.to_string());
                }
                trace!(attempts, "retrying upgrade after CloudFront-style 400");
            }
        }
    }
}

/// Close codes that are always safe to treat as "reconnect normally" by a generic transport
/// (application-level fatal-close-code policy, e.g. §4.2's 4002/4003/4008, lives one layer up).
#[must_use]
pub fn is_normal_close(code: Option<CloseCode>) -> bool {
    !matches!(code, Some(CloseCode::Abnormal) | Some(CloseCode::Invalid))
}
