//! Realtime websocket client with heartbeat liveness and bounded reconnects.
//!
//! A [`RealtimeClient`] owns at most one background worker. The worker opens
//! the socket with the active session's credential, runs the heartbeat, routes
//! inbound frames to subscribers and, after an unrequested close, sleeps a
//! fixed delay and repeats the whole credential-lookup-and-open sequence.
//!
//! Every callback is invoked under the client's dispatch lock and only while
//! the worker's generation is current, so nothing fires for a connection once
//! [`RealtimeClient::disconnect`] has returned.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, ReentrantMutex};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::realtime::proto::{ClientFrame, ServerFrame};
use crate::retry::ReconnectPolicy;
use crate::session::CredentialSource;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket endpoint of a local development server.
pub const LOCAL_REALTIME_ENDPOINT: &str = "ws://localhost:20180/ws/ws";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RealtimeDefaults;

impl RealtimeDefaults {
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const PONG_TIMEOUT: Duration = Duration::from_secs(5);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    pub const RECONNECT_LIMIT: u32 = 5;
}

/// Timer and reconnect settings for a [`RealtimeClient`].
#[derive(Clone, Debug)]
pub struct RealtimeOptions {
    /// Period between liveness checks while connected.
    pub heartbeat_interval: Duration,
    /// How long a liveness check waits for its reply.
    pub pong_timeout: Duration,
    /// Reconnect budget and delay after unrequested closes.
    pub reconnect: ReconnectPolicy,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: RealtimeDefaults::HEARTBEAT_INTERVAL,
            pong_timeout: RealtimeDefaults::PONG_TIMEOUT,
            reconnect: ReconnectPolicy {
                limit: RealtimeDefaults::RECONNECT_LIMIT,
                delay: RealtimeDefaults::RECONNECT_DELAY,
            },
        }
    }
}

/// Externally observable link status.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

/// Why a connection ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// The caller invoked [`RealtimeClient::disconnect`].
    Requested,
    /// The server closed the socket or the stream ended.
    PeerClosed,
    /// The socket could not be opened or failed mid-stream.
    TransportFailed,
    /// No liveness reply arrived before the pong deadline.
    DeadPeer,
}

impl CloseReason {
    /// Whether this close may be followed by an automatic reconnect.
    pub fn allows_reconnect(self) -> bool {
        !matches!(self, Self::Requested)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::PeerClosed => f.write_str("peer_closed"),
            Self::TransportFailed => f.write_str("transport_failed"),
            Self::DeadPeer => f.write_str("dead_peer"),
        }
    }
}

/// Errors produced by realtime transport and protocol handling.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint is not a valid URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// Endpoint uses a scheme other than `ws` or `wss`.
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    /// No credential is available for the active session.
    #[error("no credential for the active session")]
    MissingCredential,
}

type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;
type OpenHandler = Arc<dyn Fn() + Send + Sync>;
type CloseHandler = Arc<dyn Fn(CloseReason) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&RealtimeError) + Send + Sync>;

#[derive(Clone, Default)]
struct Subscribers {
    message: Vec<MessageHandler>,
    open: Vec<OpenHandler>,
    close: Vec<CloseHandler>,
    error: Vec<ErrorHandler>,
}

#[derive(Default)]
struct LinkState {
    status: ConnectionStatus,
    reconnect_attempts: u32,
    generation: u64,
    // Present while a worker is connecting, connected or waiting to reconnect.
    worker: Option<oneshot::Sender<()>>,
}

struct Shared {
    endpoint: Url,
    credentials: Arc<dyn CredentialSource>,
    options: RealtimeOptions,
    subscribers: Mutex<Subscribers>,
    state: Mutex<LinkState>,
    dispatch: ReentrantMutex<()>,
}

/// Single-connection realtime client.
///
/// Subscribers are append-only and called in registration order. Handlers may
/// call back into the client, including [`RealtimeClient::disconnect`].
pub struct RealtimeClient {
    shared: Arc<Shared>,
}

impl RealtimeClient {
    /// Creates a client for `endpoint` with default timers.
    pub fn new(
        endpoint: &str,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, RealtimeError> {
        Self::with_options(endpoint, credentials, RealtimeOptions::default())
    }

    /// Creates a client for `endpoint` with explicit timers.
    pub fn with_options(
        endpoint: &str,
        credentials: Arc<dyn CredentialSource>,
        options: RealtimeOptions,
    ) -> Result<Self, RealtimeError> {
        Ok(Self {
            shared: Arc::new(Shared {
                endpoint: parse_endpoint(endpoint)?,
                credentials,
                options,
                subscribers: Mutex::new(Subscribers::default()),
                state: Mutex::new(LinkState::default()),
                dispatch: ReentrantMutex::new(()),
            }),
        })
    }

    /// Target endpoint, without credentials.
    pub fn endpoint(&self) -> &str {
        self.shared.endpoint.as_str()
    }

    /// Starts connecting in the background.
    ///
    /// Outcomes arrive through the open, close and error subscribers. Without
    /// a credential the attempt is abandoned and logged. Calling this while a
    /// connection or pending reconnect exists does nothing. Each explicit call
    /// starts a fresh reconnect budget.
    pub fn connect(&self) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(event = "realtime_connect_without_runtime", error = %err);
                return;
            }
        };

        let Some(credential) = self.shared.credentials.credential() else {
            warn!(
                event = "realtime_missing_credential",
                error = %RealtimeError::MissingCredential
            );
            return;
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let generation = {
            let mut state = self.shared.state.lock();
            if state.worker.is_some() {
                debug!(event = "realtime_connect_ignored", status = %state.status);
                return;
            }
            state.generation += 1;
            state.reconnect_attempts = 0;
            state.worker = Some(shutdown_tx);
            state.generation
        };

        runtime.spawn(connection_worker(
            Arc::clone(&self.shared),
            generation,
            credential,
            shutdown_rx,
        ));
    }

    /// Closes the connection and cancels heartbeat and reconnect timers.
    ///
    /// Idempotent. When a connection was open, close subscribers run with
    /// [`CloseReason::Requested`] before this returns.
    pub fn disconnect(&self) {
        let _dispatch = self.shared.dispatch.lock();
        let (worker, was_connected) = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            let was_connected = state.status == ConnectionStatus::Connected;
            state.status = ConnectionStatus::Disconnected;
            (state.worker.take(), was_connected)
        };

        let Some(worker) = worker else {
            return;
        };
        let _ = worker.send(());
        info!(event = "realtime_disconnect_requested", was_connected);

        if was_connected {
            let subscribers = self.shared.snapshot();
            for handler in &subscribers.close {
                handler(CloseReason::Requested);
            }
        }
    }

    /// Appends a handler for inbound message payloads.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.subscribers.lock().message.push(Arc::new(handler));
    }

    /// Appends a handler for successful opens.
    pub fn on_open<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.subscribers.lock().open.push(Arc::new(handler));
    }

    /// Appends a handler for closes.
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(CloseReason) + Send + Sync + 'static,
    {
        self.shared.subscribers.lock().close.push(Arc::new(handler));
    }

    /// Appends a handler for transport errors.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.shared.subscribers.lock().error.push(Arc::new(handler));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Reconnects made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.state.lock().reconnect_attempts
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        let worker = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.status = ConnectionStatus::Disconnected;
            state.worker.take()
        };
        if let Some(worker) = worker {
            let _ = worker.send(());
        }
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.endpoint())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn snapshot(&self) -> Subscribers {
        self.subscribers.lock().clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn mark_open(&self, generation: u64) -> bool {
        let _dispatch = self.dispatch.lock();
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            state.status = ConnectionStatus::Connected;
            state.reconnect_attempts = 0;
        }
        info!(event = "realtime_open", endpoint = %self.endpoint);
        for handler in &self.snapshot().open {
            handler();
        }
        true
    }

    fn deliver(&self, generation: u64, data: &Value) -> bool {
        let _dispatch = self.dispatch.lock();
        if !self.is_current(generation) {
            return false;
        }
        for handler in &self.snapshot().message {
            handler(data);
        }
        true
    }

    fn report_error(&self, generation: u64, err: &RealtimeError) {
        let _dispatch = self.dispatch.lock();
        if !self.is_current(generation) {
            return;
        }
        warn!(event = "realtime_error", error = %err);
        for handler in &self.snapshot().error {
            handler(err);
        }
    }

    /// Records an unrequested close and returns the next reconnect, if any.
    fn mark_closed(&self, generation: u64, reason: CloseReason) -> Option<(u32, Duration)> {
        let _dispatch = self.dispatch.lock();
        let next = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return None;
            }
            state.status = ConnectionStatus::Disconnected;
            let next = if reason.allows_reconnect() {
                self.options.reconnect.next_attempt(state.reconnect_attempts)
            } else {
                None
            };
            match next {
                Some((attempt, _)) => state.reconnect_attempts = attempt,
                None => state.worker = None,
            }
            next
        };

        info!(event = "realtime_closed", reason = %reason);
        if next.is_none() && reason.allows_reconnect() {
            warn!(
                event = "realtime_reconnect_exhausted",
                limit = self.options.reconnect.limit
            );
        }
        for handler in &self.snapshot().close {
            handler(reason);
        }
        next
    }

    fn abandon(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.status = ConnectionStatus::Disconnected;
            state.worker = None;
        }
    }
}

enum LinkOutcome {
    Requested,
    Closed(CloseReason),
}

async fn connection_worker(
    shared: Arc<Shared>,
    generation: u64,
    credential: SecretString,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut credential = Some(credential);

    loop {
        let Some(token) = credential.take().or_else(|| shared.credentials.credential()) else {
            warn!(
                event = "realtime_missing_credential",
                error = %RealtimeError::MissingCredential
            );
            shared.abandon(generation);
            return;
        };

        let reason = match run_connection(&shared, generation, &token, &mut shutdown).await {
            LinkOutcome::Requested => return,
            LinkOutcome::Closed(reason) => reason,
        };

        let Some((attempt, delay)) = shared.mark_closed(generation, reason) else {
            return;
        };
        info!(
            event = "realtime_reconnect_scheduled",
            attempt,
            limit = shared.options.reconnect.limit,
            delay_ms = delay.as_millis() as u64,
            reason = %reason
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown => return,
        }
    }
}

async fn run_connection(
    shared: &Shared,
    generation: u64,
    token: &SecretString,
    shutdown: &mut oneshot::Receiver<()>,
) -> LinkOutcome {
    let url = upgrade_url(&shared.endpoint, token);
    debug!(event = "realtime_connecting", endpoint = %shared.endpoint);

    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = &mut *shutdown => return LinkOutcome::Requested,
    };
    let mut socket = match connected {
        Ok((socket, _)) => socket,
        Err(err) => {
            shared.report_error(generation, &RealtimeError::WebSocket(err));
            return LinkOutcome::Closed(CloseReason::TransportFailed);
        }
    };

    if !shared.mark_open(generation) {
        let _ = socket.close(None).await;
        return LinkOutcome::Requested;
    }

    let interval = shared.options.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                let _ = socket.close(None).await;
                return LinkOutcome::Requested;
            }
            _ = heartbeat.tick() => {
                if let Err(err) = send_client_frame(&mut socket, &ClientFrame::Ping).await {
                    shared.report_error(generation, &err);
                    return LinkOutcome::Closed(CloseReason::TransportFailed);
                }
                debug!(event = "heartbeat_ping");
                // An outstanding deadline keeps running; later pings never extend it.
                if pong_deadline.is_none() {
                    pong_deadline =
                        Some(Box::pin(tokio::time::sleep(shared.options.pong_timeout)));
                }
            }
            _ = pong_deadline_elapsed(&mut pong_deadline) => {
                warn!(
                    event = "pong_timeout",
                    timeout_ms = shared.options.pong_timeout.as_millis() as u64
                );
                let _ = socket.close(None).await;
                return LinkOutcome::Closed(CloseReason::DeadPeer);
            }
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match ServerFrame::from_text(text.as_str()) {
                        Ok(ServerFrame::Pong) => {
                            debug!(event = "heartbeat_pong");
                            pong_deadline = None;
                        }
                        Ok(ServerFrame::Message { data }) => {
                            if !shared.deliver(generation, &data) {
                                let _ = socket.close(None).await;
                                return LinkOutcome::Requested;
                            }
                        }
                        Ok(ServerFrame::Unknown) => {
                            debug!(event = "frame_dropped", reason = "unknown_type");
                        }
                        Err(err) => {
                            warn!(event = "frame_dropped", reason = "undecodable", error = %err);
                        }
                    },
                    Some(Ok(Message::Binary(payload))) => {
                        warn!(event = "frame_dropped", reason = "binary", len = payload.len());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            shared.report_error(generation, &RealtimeError::WebSocket(err));
                            return LinkOutcome::Closed(CloseReason::TransportFailed);
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!(event = "realtime_peer_close", frame = ?frame);
                        return LinkOutcome::Closed(CloseReason::PeerClosed);
                    }
                    Some(Err(err)) => {
                        shared.report_error(generation, &RealtimeError::WebSocket(err));
                        return LinkOutcome::Closed(CloseReason::TransportFailed);
                    }
                    None => return LinkOutcome::Closed(CloseReason::PeerClosed),
                }
            }
        }
    }
}

async fn pong_deadline_elapsed(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline.as_mut() {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

async fn send_client_frame(socket: &mut Socket, frame: &ClientFrame) -> Result<(), RealtimeError> {
    let text = frame.to_text()?;
    socket.send(Message::Text(text.into())).await?;
    Ok(())
}

fn parse_endpoint(endpoint: &str) -> Result<Url, RealtimeError> {
    let url = Url::parse(endpoint.trim())?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(RealtimeError::UnsupportedScheme(other.to_string())),
    }
}

/// The credential travels as a `token` query parameter.
fn upgrade_url(endpoint: &Url, token: &SecretString) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("token", token.expose_secret());
    url
}
