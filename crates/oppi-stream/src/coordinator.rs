//! Connection coordinator: one per server.
//!
//! Wires the transport, router, registry and watchdog together and is the
//! only type most callers touch. Also owns the degraded-mode REST refresh
//! and the reconnect-needed hand-off to whoever manages app lifecycle.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use oppi_api::ControlPlane;
use oppi_core::errors::{StreamError, StreamResult};
use oppi_core::protocol::{
    ClientCommand, ImageAttachment, PermissionAction, ServerFrame, SubscriptionLevel, TurnKind,
    TurnPayload, command_names, frame_types,
};
use oppi_core::SessionId;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::events::ConnectionEvent;
use crate::registry::{CommandRegistry, CommandSink, StageObserver, TurnOutcome};
use crate::router::{FrameHook, SessionStream, SubscriptionRouter};
use crate::socket::Connector;
use crate::transport::{ConnectionStatus, StreamTransport};
use crate::watchdog::{LivenessDelegate, LivenessWatchdog};

/// Receives reconnect-needed notices from the watchdog. When none is set the
/// coordinator reconnects on its own.
pub type ReconnectHandler = Arc<dyn Fn(&SessionId) + Send + Sync>;

const EVENT_CAPACITY: usize = 256;

/// Point-in-time view of the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Transport status.
    pub status: ConnectionStatus,
    /// Current connection epoch.
    pub epoch: u64,
    /// Focused session.
    pub focused: Option<SessionId>,
    /// Sessions with a subscription record.
    pub tracked_sessions: usize,
    /// Commands awaiting a reply.
    pub pending_commands: usize,
}

#[derive(Clone)]
struct Engine {
    transport: StreamTransport,
    router: SubscriptionRouter,
}

struct Inner {
    config: CoordinatorConfig,
    registry: Arc<CommandRegistry>,
    watchdog: LivenessWatchdog,
    events: broadcast::Sender<ConnectionEvent>,
    engine: Mutex<Engine>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    reconnect_handler: Mutex<Option<ReconnectHandler>>,
    supervisor: Mutex<Option<CancellationToken>>,
}

/// Streaming engine for one server. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionCoordinator {
    inner: Arc<Inner>,
}

impl ConnectionCoordinator {
    /// Build an idle coordinator. `control_plane` enables REST refresh of
    /// the focused session while the stream is down.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: CoordinatorConfig,
        control_plane: Option<Arc<dyn ControlPlane>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let registry = Arc::new(CommandRegistry::new(config.registry.clone()));
            let (events, _) = broadcast::channel(EVENT_CAPACITY);
            let watchdog = LivenessWatchdog::new(
                config.watchdog.clone(),
                Arc::new(WatchdogDelegate {
                    inner: weak.clone(),
                }),
            );
            let engine = build_engine(connector, &config, &registry, &events, &watchdog);
            Inner {
                config,
                registry,
                watchdog,
                events,
                engine: Mutex::new(engine),
                control_plane,
                reconnect_handler: Mutex::new(None),
                supervisor: Mutex::new(None),
            }
        });
        Self { inner }
    }

    /// Open the stream (if needed) and start status supervision.
    pub fn connect(&self) {
        let engine = self.engine();
        engine.router.start();

        let token = {
            let mut supervisor = self.inner.supervisor.lock();
            if supervisor.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return;
            }
            let token = CancellationToken::new();
            *supervisor = Some(token.clone());
            token
        };
        let _ = tokio::spawn(supervise(
            engine.transport.subscribe_status(),
            engine.router,
            self.inner.control_plane.clone(),
            self.inner.events.clone(),
            self.inner.config.degraded_poll_interval,
            token,
        ));
    }

    /// Force a fresh socket. Subscriptions are restored once the server
    /// signals the new stream.
    pub fn reconnect(&self) {
        let engine = self.engine();
        if !engine.transport.reconnect() {
            self.connect();
        }
    }

    /// Tear down the connection. Every pending command fails with
    /// `NotConnected` before the transport goes away.
    pub fn teardown(&self) {
        self.inner.watchdog.stop();
        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            supervisor.cancel();
        }
        let failed = self.inner.registry.fail_all(&StreamError::NotConnected);
        let engine = self.engine();
        engine.router.shutdown();
        engine.transport.disconnect();
        let _ = self
            .inner
            .events
            .send(ConnectionEvent::StatusChanged(ConnectionStatus::Disconnected));
        info!(failed, "connection torn down");
    }

    /// Tear down and rebuild the engine against another endpoint. Call
    /// [`connect`](Self::connect) or subscribe again afterwards.
    pub fn switch_endpoint(&self, connector: Arc<dyn Connector>) {
        self.teardown();
        let engine = build_engine(
            connector,
            &self.inner.config,
            &self.inner.registry,
            &self.inner.events,
            &self.inner.watchdog,
        );
        *self.inner.engine.lock() = engine;
        info!("stream endpoint switched");
    }

    /// Focus `session_id` and return its full event stream.
    pub async fn stream_session(&self, session_id: &SessionId) -> StreamResult<SessionStream> {
        self.connect();
        let engine = self.engine();
        if self
            .inner
            .watchdog
            .armed_session()
            .is_some_and(|armed| &armed != session_id)
        {
            self.inner.watchdog.stop();
        }
        engine
            .router
            .stream_session(session_id, SubscriptionLevel::Full)
            .await
    }

    /// Track `session_id` at notifications level.
    pub async fn watch_session(&self, session_id: &SessionId) -> StreamResult<()> {
        self.connect();
        self.engine().router.subscribe_notifications(session_id).await
    }

    /// Drop focus; the session stays at notifications level.
    pub fn unfocus(&self) {
        self.inner.watchdog.stop();
        self.engine().router.unfocus();
    }

    /// Stop tracking `session_id`.
    pub fn close_session(&self, session_id: &SessionId) {
        self.inner.watchdog.stop_for(session_id);
        self.engine().router.unsubscribe_session(session_id);
    }

    /// Send a staged turn.
    pub async fn send_turn(
        &self,
        kind: TurnKind,
        session_id: &SessionId,
        message: &str,
        images: Vec<ImageAttachment>,
        observer: Option<StageObserver>,
    ) -> StreamResult<TurnOutcome> {
        let engine = self.engine();
        if engine.router.focused().as_ref() == Some(session_id) {
            self.inner.watchdog.arm(session_id);
        }
        let scope = engine.transport.scoped(session_id);
        let message = message.to_owned();
        self.inner
            .registry
            .send_turn_command(
                &scope,
                kind.command_name(),
                move |attempt| {
                    kind.into_command(TurnPayload {
                        message: message.clone(),
                        images: images.clone(),
                        request_id: attempt.request_id,
                        turn_id: attempt.turn_id,
                    })
                },
                observer,
            )
            .await
    }

    /// Start a new turn.
    pub async fn send_prompt(&self, session_id: &SessionId, message: &str) -> StreamResult<TurnOutcome> {
        self.send_turn(TurnKind::Prompt, session_id, message, Vec::new(), None)
            .await
    }

    /// Redirect the running turn.
    pub async fn send_steer(&self, session_id: &SessionId, message: &str) -> StreamResult<TurnOutcome> {
        self.send_turn(TurnKind::Steer, session_id, message, Vec::new(), None)
            .await
    }

    /// Queue a message after the running turn.
    pub async fn send_follow_up(
        &self,
        session_id: &SessionId,
        message: &str,
    ) -> StreamResult<TurnOutcome> {
        self.send_turn(TurnKind::FollowUp, session_id, message, Vec::new(), None)
            .await
    }

    /// One-shot session command; returns the result's `data`.
    pub async fn send_command(
        &self,
        session_id: &SessionId,
        name: &str,
        params: Map<String, Value>,
    ) -> StreamResult<Option<Value>> {
        let engine = self.engine();
        let scope = engine.transport.scoped(session_id);
        self.inner
            .registry
            .send_command(&scope, name, |request_id| ClientCommand::Generic {
                name: name.to_owned(),
                request_id,
                params,
            })
            .await
    }

    /// Ask for a state snapshot of `session_id`.
    pub async fn request_state(&self, session_id: &SessionId) -> StreamResult<Option<Value>> {
        let engine = self.engine();
        let scope = engine.transport.scoped(session_id);
        self.inner
            .registry
            .send_command(&scope, command_names::GET_STATE, |request_id| {
                ClientCommand::GetState { request_id }
            })
            .await
    }

    /// Answer a permission request. Sent without waiting for a reply; the
    /// outcome shows up in the session's own events.
    pub async fn respond_permission(
        &self,
        session_id: &SessionId,
        permission_id: &str,
        action: PermissionAction,
    ) -> StreamResult<()> {
        let command = ClientCommand::PermissionResponse {
            session_id: session_id.clone(),
            permission_id: permission_id.to_owned(),
            action,
            request_id: oppi_core::RequestId::new(),
        };
        self.engine().transport.dispatch(&command).await
    }

    /// Connection-level notifications.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Current transport status.
    pub fn status(&self) -> ConnectionStatus {
        self.engine().transport.status()
    }

    /// Snapshot of the connection.
    pub fn connection_state(&self) -> ConnectionSnapshot {
        let engine = self.engine();
        ConnectionSnapshot {
            status: engine.transport.status(),
            epoch: engine.transport.epoch(),
            focused: engine.router.focused(),
            tracked_sessions: engine.router.tracked_sessions().len(),
            pending_commands: self.inner.registry.pending_count(),
        }
    }

    /// Install the reconnect-needed callback.
    pub fn set_reconnect_handler<F>(&self, handler: F)
    where
        F: Fn(&SessionId) + Send + Sync + 'static,
    {
        *self.inner.reconnect_handler.lock() = Some(Arc::new(handler));
    }

    /// The router, for callers that need per-session subscription state.
    pub fn router(&self) -> SubscriptionRouter {
        self.engine().router
    }

    /// The liveness watchdog.
    pub fn watchdog(&self) -> &LivenessWatchdog {
        &self.inner.watchdog
    }

    fn engine(&self) -> Engine {
        self.inner.engine.lock().clone()
    }
}

fn build_engine(
    connector: Arc<dyn Connector>,
    config: &CoordinatorConfig,
    registry: &Arc<CommandRegistry>,
    events: &broadcast::Sender<ConnectionEvent>,
    watchdog: &LivenessWatchdog,
) -> Engine {
    let transport = StreamTransport::new(connector, config.transport.clone());
    let router = SubscriptionRouter::new(
        transport.clone(),
        registry.clone(),
        config.router.clone(),
        events.clone(),
        Some(activity_hook(watchdog.clone())),
    );
    Engine { transport, router }
}

/// Feeds session activity into the watchdog.
fn activity_hook(watchdog: LivenessWatchdog) -> FrameHook {
    Arc::new(move |frame: &ServerFrame, focused: bool| {
        let Some(session_id) = &frame.session_id else {
            return;
        };
        match frame.kind.as_str() {
            frame_types::AGENT_START if focused => watchdog.arm(session_id),
            frame_types::AGENT_END | frame_types::SESSION_ENDED => watchdog.stop_for(session_id),
            _ => watchdog.touch(session_id),
        }
    })
}

struct WatchdogDelegate {
    inner: Weak<Inner>,
}

#[async_trait]
impl LivenessDelegate for WatchdogDelegate {
    async fn probe(&self, session_id: &SessionId) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let coordinator = ConnectionCoordinator { inner };
        let session_id = session_id.clone();
        let _ = tokio::spawn(async move {
            if let Err(error) = coordinator.request_state(&session_id).await {
                debug!(session_id = %session_id, error = %error, "liveness probe failed");
            }
        });
    }

    async fn reconnect(&self, session_id: &SessionId) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let _ = inner.events.send(ConnectionEvent::ReconnectNeeded {
            session_id: session_id.clone(),
        });
        let handler = inner.reconnect_handler.lock().clone();
        match handler {
            Some(handler) => handler(session_id),
            None => {
                info!(session_id = %session_id, "reconnecting silent stream");
                ConnectionCoordinator { inner }.reconnect();
            }
        }
    }
}

/// Publishes status changes and refreshes the focused session over REST
/// while the stream is not connected.
async fn supervise(
    mut status: watch::Receiver<ConnectionStatus>,
    router: SubscriptionRouter,
    control_plane: Option<Arc<dyn ControlPlane>>,
    events: broadcast::Sender<ConnectionEvent>,
    poll_interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut current = *status.borrow_and_update();
    let poll_interval = poll_interval.max(std::time::Duration::from_millis(1));
    let mut poll = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let degraded = control_plane.is_some() && !current.is_connected();
        tokio::select! {
            () = cancel.cancelled() => return,
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                let next = *status.borrow_and_update();
                if next == current {
                    continue;
                }
                if current.is_connected() && !next.is_connected() {
                    poll.reset();
                }
                current = next;
                let _ = events.send(ConnectionEvent::StatusChanged(next));
            }
            _ = poll.tick(), if degraded => {
                let (Some(control_plane), Some(session_id)) = (&control_plane, router.focused()) else {
                    continue;
                };
                let fetched = tokio::select! {
                    () = cancel.cancelled() => return,
                    fetched = control_plane.get_session(&session_id) => fetched,
                };
                match fetched {
                    Ok(summary) => {
                        let _ = events.send(ConnectionEvent::SessionSnapshot(summary));
                    }
                    Err(error) => {
                        warn!(session_id = %session_id, error = %error, "degraded refresh failed");
                    }
                }
            }
        }
    }
}
