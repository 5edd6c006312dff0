//! Stream transport: the single physical connection to one server.
//!
//! ## Lifecycle
//!
//! ```text
//! connect() ──► Connecting ──first frame──► Connected
//!                   │                          │ socket error / close /
//!                   │ open failed              │ heartbeat failures
//!                   ▼                          ▼
//!             Reconnecting(n) ◄────────────────┘
//!                   │ attempts exhausted
//!                   ▼
//!             Disconnected (terminal until connect()/reconnect())
//! ```
//!
//! Every open attempt runs under a fresh connection epoch. Background loops
//! capture the epoch they were started with, and any callback carrying an
//! older epoch is ignored, so a late failure from a replaced socket can
//! never tear down the connection that replaced it.
//!
//! ## Concurrency
//!
//! All link state sits behind one `parking_lot::Mutex` that is never held
//! across an await. The receive loop, heartbeat loop and reconnect timer
//! are separate tasks, each with its own cancellation token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use oppi_core::errors::{StreamError, StreamResult};
use oppi_core::protocol::{ClientCommand, ServerFrame};
use oppi_core::SessionId;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::registry::CommandSink;
use crate::socket::{Connector, SocketSink, SocketStream, WireMessage};
use crate::telemetry;
use crate::waiter::race_with_timeout;

/// Lifecycle status of the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No socket and no reconnect pending.
    Disconnected,
    /// First open in progress.
    Connecting,
    /// A frame has been received on the current socket.
    Connected,
    /// Waiting for, or running, reconnect attempt `attempt`.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
}

impl ConnectionStatus {
    /// Whether commands can be sent.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Short label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// Item of the inbound sequence returned by [`StreamTransport::connect`].
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A decoded frame.
    Frame(ServerFrame),
    /// The live socket went away.
    Disconnected {
        /// Human-readable cause.
        reason: String,
        /// Whether a reconnect has been scheduled.
        will_reconnect: bool,
    },
}

/// Pull-based inbound sequence. Ends when the transport is disconnected or
/// replaced by a newer `connect()`.
pub type TransportEvents = ReceiverStream<TransportEvent>;

/// Handle to the transport. Cheap to clone.
#[derive(Clone)]
pub struct StreamTransport {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    status: watch::Sender<ConnectionStatus>,
    state: Mutex<LinkState>,
}

#[derive(Default)]
struct LinkState {
    epoch: u64,
    sink: Option<Arc<dyn SocketSink>>,
    link_cancel: Option<CancellationToken>,
    reconnect_cancel: Option<CancellationToken>,
    events: Option<mpsc::Sender<TransportEvent>>,
    attempt: u32,
    last_inbound: Option<Instant>,
    last_receive_error: Option<(String, Instant)>,
}

impl LinkState {
    /// Cancel the live link and any pending reconnect, returning the sink.
    fn release_link(&mut self) -> Option<Arc<dyn SocketSink>> {
        if let Some(cancel) = self.link_cancel.take() {
            cancel.cancel();
        }
        if let Some(cancel) = self.reconnect_cancel.take() {
            cancel.cancel();
        }
        self.sink.take()
    }
}

impl StreamTransport {
    /// Build an idle transport.
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                status,
                state: Mutex::new(LinkState::default()),
            }),
        }
    }

    /// Open the connection and return its inbound sequence.
    ///
    /// Any previous connection is torn down first and its sequence ends.
    pub fn connect(&self) -> TransportEvents {
        let (tx, rx) = mpsc::channel(self.shared.config.inbound_buffer);
        let (previous, epoch) = {
            let mut state = self.shared.state.lock();
            let previous = state.release_link();
            state.events = Some(tx);
            state.attempt = 0;
            state.epoch += 1;
            self.shared.set_status(ConnectionStatus::Connecting);
            (previous, state.epoch)
        };
        if let Some(sink) = previous {
            debug!("replacing existing stream connection");
            spawn_close(sink);
        }
        self.shared.spawn_open(epoch);
        ReceiverStream::new(rx)
    }

    /// Drop the current socket and open a new one immediately, keeping the
    /// inbound sequence. Returns `false` if there is no sequence to keep
    /// (call [`connect`](Self::connect) instead).
    pub fn reconnect(&self) -> bool {
        let (previous, events, epoch) = {
            let mut state = self.shared.state.lock();
            if state.events.is_none() {
                return false;
            }
            let previous = state.release_link();
            state.attempt = 0;
            state.epoch += 1;
            self.shared.set_status(ConnectionStatus::Connecting);
            (previous, state.events.clone(), state.epoch)
        };
        info!(epoch, "forcing stream reconnect");
        if let Some(sink) = previous {
            spawn_close(sink);
            if let Some(events) = events {
                emit(
                    &events,
                    TransportEvent::Disconnected {
                        reason: "reconnect requested".into(),
                        will_reconnect: true,
                    },
                );
            }
        }
        self.shared.spawn_open(epoch);
        true
    }

    /// Tear everything down and end the inbound sequence. Idempotent.
    pub fn disconnect(&self) {
        let (previous, events) = {
            let mut state = self.shared.state.lock();
            let previous = state.release_link();
            state.epoch += 1;
            state.attempt = 0;
            self.shared.set_status(ConnectionStatus::Disconnected);
            (previous, state.events.take())
        };
        if let Some(events) = events {
            if previous.is_some() {
                let _ = events.try_send(TransportEvent::Disconnected {
                    reason: "disconnected by client".into(),
                    will_reconnect: false,
                });
            }
            info!("stream transport disconnected");
        }
        if let Some(sink) = previous {
            spawn_close(sink);
        }
    }

    /// Send one text frame, racing the write against the send timeout.
    pub async fn send(&self, text: String) -> StreamResult<()> {
        let sink = {
            let state = self.shared.state.lock();
            state
                .sink
                .clone()
                .filter(|_| self.shared.status.borrow().is_connected())
        };
        let Some(sink) = sink else {
            return Err(StreamError::NotConnected);
        };

        let timeout = self.shared.config.send_timeout;
        let result =
            race_with_timeout(async move { sink.send(WireMessage::Text(text)).await }, timeout)
                .await;
        if let Err(StreamError::SendTimeout(after)) = &result {
            metrics::counter!(telemetry::STREAM_SEND_TIMEOUTS_TOTAL).increment(1);
            warn!(?after, "stream write timed out");
        }
        result
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Status change notifications.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Current connection epoch.
    pub fn epoch(&self) -> u64 {
        self.shared.state.lock().epoch
    }

    /// Whether an inbound sequence is live (connected or trying to be).
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().events.is_some()
    }

    /// Wait until the status is `Connected`.
    pub async fn wait_connected(&self, timeout: Duration) -> StreamResult<()> {
        let mut rx = self.subscribe_status();
        match tokio::time::timeout(timeout, rx.wait_for(ConnectionStatus::is_connected)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(StreamError::NotConnected),
        }
    }

    /// Scope commands to `session_id`.
    pub fn scoped<'a>(&'a self, session_id: &'a SessionId) -> SessionScope<'a> {
        SessionScope {
            transport: self,
            session_id,
        }
    }
}

impl Shared {
    /// Publish `status`. Callers hold the state lock so a stale epoch can
    /// never overwrite a newer status.
    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!(status = status.as_str(), "stream status changed");
        }
    }

    fn spawn_open(self: &Arc<Self>, epoch: u64) {
        let shared = self.clone();
        let _ = tokio::spawn(async move { shared.open(epoch).await });
    }

    async fn open(self: Arc<Self>, epoch: u64) {
        let connect_timeout = self.config.connect_timeout;
        let result = tokio::time::timeout(connect_timeout, self.connector.connect())
            .await
            .unwrap_or_else(|_| {
                Err(StreamError::Transport(format!(
                    "connect timed out after {connect_timeout:?}"
                )))
            });

        let socket = match result {
            Ok(socket) => socket,
            Err(error) => {
                warn!(epoch, error = %error, "stream open failed");
                self.schedule_reconnect(epoch, error.to_string(), false);
                return;
            }
        };

        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                drop(state);
                debug!(epoch, "discarding socket opened for a stale epoch");
                spawn_close(socket.sink);
                return;
            }
            state.sink = Some(socket.sink.clone());
            state.link_cancel = Some(cancel.clone());
            state.last_inbound = Some(Instant::now());
        }
        debug!(epoch, "stream socket attached");

        let _ = tokio::spawn(self.clone().receive_loop(epoch, socket.stream, cancel.clone()));
        let _ = tokio::spawn(self.heartbeat_loop(epoch, socket.sink, cancel));
    }

    async fn receive_loop(
        self: Arc<Self>,
        epoch: u64,
        mut stream: SocketStream,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(WireMessage::Text(text))) => {
                    self.mark_inbound(epoch);
                    let frame = match ServerFrame::decode(&text) {
                        Ok(frame) => frame,
                        Err(error) => {
                            metrics::counter!(telemetry::STREAM_FRAMES_DROPPED_TOTAL, "reason" => "decode")
                                .increment(1);
                            warn!(epoch, error = %error, "dropping undecodable frame");
                            continue;
                        }
                    };
                    metrics::counter!(telemetry::STREAM_FRAMES_DECODED_TOTAL).increment(1);
                    self.mark_connected(epoch);

                    let Some(events) = self.events_for(epoch) else {
                        return;
                    };
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        sent = events.send(TransportEvent::Frame(frame)) => {
                            if sent.is_err() {
                                debug!(epoch, "inbound sequence dropped by consumer");
                            }
                        }
                    }
                }
                Some(Ok(WireMessage::Ping(_) | WireMessage::Pong(_))) => self.mark_inbound(epoch),
                Some(Ok(WireMessage::Close(reason))) => {
                    let reason = reason
                        .filter(|r| !r.is_empty())
                        .map_or_else(|| "closed by server".to_string(), |r| format!("closed by server: {r}"));
                    self.link_failed(epoch, reason);
                    return;
                }
                Some(Err(error)) => {
                    self.log_receive_error(&error);
                    self.link_failed(epoch, error.to_string());
                    return;
                }
                None => {
                    self.link_failed(epoch, "stream ended".into());
                    return;
                }
            }
        }
    }

    async fn heartbeat_loop(
        self: Arc<Self>,
        epoch: u64,
        sink: Arc<dyn SocketSink>,
        cancel: CancellationToken,
    ) {
        let interval = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let max_failures = self.config.heartbeat_max_failures;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;
        let mut last_ping: Option<Instant> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let answered = last_ping.is_none_or(|sent| self.heard_since(sent));
            let sent_at = Instant::now();
            let ping = {
                let sink = sink.clone();
                race_with_timeout(
                    async move { sink.send(WireMessage::Ping(Vec::new())).await },
                    self.config.send_timeout,
                )
            };
            let written = tokio::select! {
                () = cancel.cancelled() => return,
                result = ping => result,
            };
            last_ping = Some(sent_at);

            if answered && written.is_ok() {
                failures = 0;
                continue;
            }
            failures += 1;
            warn!(epoch, failures, answered, "heartbeat failed");
            if failures >= max_failures {
                self.link_failed(epoch, format!("{failures} consecutive heartbeat failures"));
                return;
            }
        }
    }

    fn mark_inbound(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch {
            state.last_inbound = Some(Instant::now());
        }
    }

    fn heard_since(&self, at: Instant) -> bool {
        self.state
            .lock()
            .last_inbound
            .is_some_and(|last| last >= at)
    }

    fn mark_connected(&self, epoch: u64) {
        let flipped = {
            let mut state = self.state.lock();
            if state.epoch != epoch || self.status.borrow().is_connected() {
                false
            } else {
                state.attempt = 0;
                self.set_status(ConnectionStatus::Connected);
                true
            }
        };
        if flipped {
            info!(epoch, "stream connected");
        }
    }

    fn events_for(&self, epoch: u64) -> Option<mpsc::Sender<TransportEvent>> {
        let state = self.state.lock();
        if state.epoch == epoch {
            state.events.clone()
        } else {
            None
        }
    }

    fn log_receive_error(&self, error: &StreamError) {
        let message = error.to_string();
        let now = Instant::now();
        let cooldown = self.config.receive_error_cooldown;
        let repeated = {
            let mut state = self.state.lock();
            let repeated = matches!(
                &state.last_receive_error,
                Some((previous, at)) if *previous == message && now.duration_since(*at) < cooldown
            );
            if !repeated {
                state.last_receive_error = Some((message.clone(), now));
            }
            repeated
        };
        if repeated {
            debug!(error = %message, "stream receive failed (repeat)");
        } else {
            warn!(error = %message, "stream receive failed");
        }
    }

    /// The live link for `epoch` is gone.
    fn link_failed(self: &Arc<Self>, epoch: u64, reason: String) {
        let sink = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                debug!(epoch, current = state.epoch, "ignoring failure from stale link");
                return;
            }
            if let Some(cancel) = state.link_cancel.take() {
                cancel.cancel();
            }
            state.sink.take()
        };
        if let Some(sink) = sink {
            spawn_close(sink);
        }
        self.schedule_reconnect(epoch, reason, true);
    }

    /// Arm the reconnect timer unless one is already pending.
    fn schedule_reconnect(self: &Arc<Self>, epoch: u64, reason: String, was_live: bool) {
        let (attempt, cancel, events) = {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.events.is_none() {
                return;
            }
            if state.reconnect_cancel.is_some() {
                debug!(epoch, "reconnect already pending");
                return;
            }
            state.attempt += 1;
            let attempt = state.attempt;
            let events = state.events.clone();
            if self.config.backoff.allows(attempt) {
                let cancel = CancellationToken::new();
                state.reconnect_cancel = Some(cancel.clone());
                self.set_status(ConnectionStatus::Reconnecting { attempt });
                (attempt, Some(cancel), events)
            } else {
                state.attempt = 0;
                self.set_status(ConnectionStatus::Disconnected);
                (attempt, None, events)
            }
        };

        let Some(cancel) = cancel else {
            warn!(attempts = attempt - 1, %reason, "reconnect attempts exhausted, giving up");
            if let Some(events) = events {
                emit(
                    &events,
                    TransportEvent::Disconnected {
                        reason,
                        will_reconnect: false,
                    },
                );
            }
            return;
        };

        let delay = self.config.backoff.jittered_delay(attempt);
        metrics::counter!(telemetry::STREAM_RECONNECT_ATTEMPTS_TOTAL).increment(1);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        info!(attempt, delay_ms, %reason, "scheduling stream reconnect");
        if was_live {
            if let Some(events) = &events {
                emit(
                    events,
                    TransportEvent::Disconnected {
                        reason,
                        will_reconnect: true,
                    },
                );
            }
        }

        let shared = self.clone();
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let next = {
                        let mut state = shared.state.lock();
                        if state.epoch != epoch {
                            return;
                        }
                        state.reconnect_cancel = None;
                        state.epoch += 1;
                        state.epoch
                    };
                    shared.open(next).await;
                }
            }
        });
    }
}

/// Deliver a control event without blocking the caller.
fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        let events = events.clone();
        let _ = tokio::spawn(async move {
            let _ = events.send(event).await;
        });
    }
}

fn spawn_close(sink: Arc<dyn SocketSink>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let _ = handle.spawn(async move { sink.close().await });
    }
}

#[async_trait]
impl CommandSink for StreamTransport {
    async fn dispatch(&self, command: &ClientCommand) -> StreamResult<()> {
        self.send(command.encode(None)?).await
    }
}

/// Sends session-scoped commands with `sessionId` attached.
pub struct SessionScope<'a> {
    transport: &'a StreamTransport,
    session_id: &'a SessionId,
}

#[async_trait]
impl CommandSink for SessionScope<'_> {
    async fn dispatch(&self, command: &ClientCommand) -> StreamResult<()> {
        self.transport
            .send(command.encode(Some(self.session_id))?)
            .await
    }
}
