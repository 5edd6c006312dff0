//! Subscription router: many logical sessions over one transport.
//!
//! The router owns the transport's inbound sequence (the *pump*) and fans
//! frames out:
//!
//! 1. Every frame is offered to the [`CommandRegistry`] first, so
//!    subscribe results resolve before anything waits on a session channel.
//! 2. Stream-level `stream_connected` starts resubscription.
//! 3. Session frames go to that session's channel, if one is open, and
//!    frames for any session other than the focused one are also published
//!    as [`ConnectionEvent::CrossSession`].
//!
//! Per session: `unsubscribed → subscribing → subscribed(level) →
//! unsubscribing → unsubscribed`, plus `lost` while waiting for a
//! resubscribe after a disconnect. At most one session holds `full` level.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use oppi_core::errors::{StreamError, StreamResult};
use oppi_core::protocol::{
    ClientCommand, InboundSignal, SeqMeta, ServerFrame, SubscriptionLevel, command_names,
};
use oppi_core::SessionId;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::events::ConnectionEvent;
use crate::registry::CommandRegistry;
use crate::telemetry;
use crate::transport::{ConnectionStatus, StreamTransport, TransportEvent, TransportEvents};

/// Called for every routed session frame. The flag says whether the frame
/// belongs to the focused session.
pub type FrameHook = Arc<dyn Fn(&ServerFrame, bool) + Send + Sync>;

/// Where a session's subscription stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Subscribe sent, result pending.
    Subscribing,
    /// Server confirmed the subscription.
    Subscribed(SubscriptionLevel),
    /// The connection dropped; waiting for resubscription.
    Lost,
    /// Unsubscribe scheduled or in flight.
    Unsubscribing,
}

/// Recently delivered sequence metadata, used to drop replayed duplicates
/// and to follow the server's head sequence.
#[derive(Debug)]
struct SeqTracker {
    recent: VecDeque<SeqMeta>,
    limit: usize,
    last_consumed: Option<u64>,
    server_head: Option<u64>,
}

impl SeqTracker {
    fn new(limit: usize) -> Self {
        Self {
            recent: VecDeque::new(),
            limit: limit.max(1),
            last_consumed: None,
            server_head: None,
        }
    }

    fn admit(&mut self, meta: SeqMeta) -> bool {
        if self.recent.iter().any(|seen| seen.seq == meta.seq) {
            return false;
        }
        let head = meta.current_seq.map_or(meta.seq, |current| current.max(meta.seq));
        self.server_head = Some(self.server_head.map_or(head, |known| known.max(head)));
        self.recent.push_back(meta);
        while self.recent.len() > self.limit {
            let _ = self.recent.pop_front();
        }
        true
    }

    fn consumed(&mut self, seq: u64) {
        self.last_consumed = Some(self.last_consumed.map_or(seq, |last| last.max(seq)));
    }
}

struct SessionRecord {
    level: SubscriptionLevel,
    state: SubscriptionState,
    tx: Option<mpsc::Sender<ServerFrame>>,
    tracker: Arc<Mutex<SeqTracker>>,
    generation: u64,
}

struct PendingUnsubscribe {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct RouterState {
    records: HashMap<SessionId, SessionRecord>,
    focused: Option<SessionId>,
    pump: Option<CancellationToken>,
    resubscribe: Option<CancellationToken>,
    next_generation: u64,
    unsubscribes: HashMap<SessionId, PendingUnsubscribe>,
}

impl RouterState {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Drop the focused session to notifications level. Returns it if it
    /// needs a fresh notifications subscribe.
    fn demote_focused(&mut self) -> Option<SessionId> {
        let previous = self.focused.take()?;
        let generation = self.next_generation();
        let record = self.records.get_mut(&previous)?;
        record.level = SubscriptionLevel::Notifications;
        record.tx = None;
        record.generation = generation;
        matches!(record.state, SubscriptionState::Subscribed(_)).then_some(previous)
    }
}

struct RouterShared {
    transport: StreamTransport,
    registry: Arc<CommandRegistry>,
    config: RouterConfig,
    events: broadcast::Sender<ConnectionEvent>,
    frame_hook: Option<FrameHook>,
    state: Mutex<RouterState>,
}

/// Handle to the router. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionRouter {
    shared: Arc<RouterShared>,
}

impl SubscriptionRouter {
    /// Build a router over `transport`. Nothing is opened until the first
    /// subscription or [`start`](Self::start).
    pub fn new(
        transport: StreamTransport,
        registry: Arc<CommandRegistry>,
        config: RouterConfig,
        events: broadcast::Sender<ConnectionEvent>,
        frame_hook: Option<FrameHook>,
    ) -> Self {
        Self {
            shared: Arc::new(RouterShared {
                transport,
                registry,
                config,
                events,
                frame_hook,
                state: Mutex::new(RouterState::default()),
            }),
        }
    }

    /// Open the transport and start routing, if not already running.
    pub fn start(&self) {
        self.shared.ensure_pump();
    }

    /// Subscribe to `session_id` and return its frame channel once the
    /// server has confirmed. A `full` subscription takes focus, demoting
    /// the previously focused session to notifications.
    pub async fn stream_session(
        &self,
        session_id: &SessionId,
        level: SubscriptionLevel,
    ) -> StreamResult<SessionStream> {
        let shared = &self.shared;
        shared.ensure_pump();
        shared
            .transport
            .wait_connected(shared.config.subscribe_timeout)
            .await?;
        shared.cancel_unsubscribe(session_id).await;

        let (tx, rx) = mpsc::channel(shared.config.session_buffer_size);
        let (generation, tracker, since_seq, demoted) = {
            let mut state = shared.state.lock();
            let demoted = match level {
                SubscriptionLevel::Full if state.focused.as_ref() != Some(session_id) => {
                    state.demote_focused()
                }
                SubscriptionLevel::Notifications if state.focused.as_ref() == Some(session_id) => {
                    state.focused = None;
                    None
                }
                _ => None,
            };
            if level == SubscriptionLevel::Full {
                state.focused = Some(session_id.clone());
            }
            let generation = state.next_generation();
            let tracker = state.records.get(session_id).map_or_else(
                || Arc::new(Mutex::new(SeqTracker::new(shared.config.sequence_queue_limit))),
                |record| record.tracker.clone(),
            );
            let since_seq = {
                let mut seqs = tracker.lock();
                seqs.recent.clear();
                seqs.last_consumed
            };
            let _ = state.records.insert(
                session_id.clone(),
                SessionRecord {
                    level,
                    state: SubscriptionState::Subscribing,
                    tx: Some(tx),
                    tracker: tracker.clone(),
                    generation,
                },
            );
            (generation, tracker, since_seq, demoted)
        };
        if let Some(previous) = demoted {
            shared.spawn_notifications_subscribe(previous);
        }

        debug!(session_id = %session_id, level = level.as_str(), ?since_seq, "subscribing");
        match shared.send_subscribe(session_id, level, since_seq).await {
            Ok(()) => {
                shared.mark_subscribed(session_id, generation);
                info!(session_id = %session_id, level = level.as_str(), "session subscribed");
                Ok(SessionStream {
                    session_id: session_id.clone(),
                    rx,
                    tracker,
                    router: Arc::downgrade(shared),
                    generation,
                })
            }
            Err(error) => {
                shared.forget(session_id, generation);
                warn!(session_id = %session_id, error = %error, "subscribe failed");
                Err(error)
            }
        }
    }

    /// Track `session_id` at notifications level without a frame channel.
    /// Its frames surface as cross-session events.
    pub async fn subscribe_notifications(&self, session_id: &SessionId) -> StreamResult<()> {
        let shared = &self.shared;
        if shared.state.lock().focused.as_ref() == Some(session_id) {
            return Ok(());
        }
        shared.ensure_pump();
        shared
            .transport
            .wait_connected(shared.config.subscribe_timeout)
            .await?;
        shared.cancel_unsubscribe(session_id).await;

        let (generation, since_seq) = {
            let mut state = shared.state.lock();
            let generation = state.next_generation();
            let tracker = state.records.get(session_id).map_or_else(
                || Arc::new(Mutex::new(SeqTracker::new(shared.config.sequence_queue_limit))),
                |record| record.tracker.clone(),
            );
            let since_seq = tracker.lock().last_consumed;
            let _ = state.records.insert(
                session_id.clone(),
                SessionRecord {
                    level: SubscriptionLevel::Notifications,
                    state: SubscriptionState::Subscribing,
                    tx: None,
                    tracker,
                    generation,
                },
            );
            (generation, since_seq)
        };

        match shared
            .send_subscribe(session_id, SubscriptionLevel::Notifications, since_seq)
            .await
        {
            Ok(()) => {
                shared.mark_subscribed(session_id, generation);
                Ok(())
            }
            Err(error) => {
                shared.forget(session_id, generation);
                Err(error)
            }
        }
    }

    /// Best-effort unsubscribe. Returns immediately; the send can be
    /// cancelled by a later subscribe for the same session.
    pub fn unsubscribe_session(&self, session_id: &SessionId) {
        let removed = {
            let mut state = self.shared.state.lock();
            if state.focused.as_ref() == Some(session_id) {
                state.focused = None;
            }
            state.records.remove(session_id).is_some()
        };
        if removed {
            self.shared.schedule_unsubscribe(session_id.clone());
        }
    }

    /// Drop focus. The session stays tracked at notifications level.
    pub fn unfocus(&self) {
        let demoted = self.shared.state.lock().demote_focused();
        if let Some(previous) = demoted {
            self.shared.spawn_notifications_subscribe(previous);
        }
    }

    /// Focused session, if any.
    pub fn focused(&self) -> Option<SessionId> {
        self.shared.state.lock().focused.clone()
    }

    /// Subscription state of `session_id`; `None` when unsubscribed.
    pub fn subscription_state(&self, session_id: &SessionId) -> Option<SubscriptionState> {
        let state = self.shared.state.lock();
        state
            .records
            .get(session_id)
            .map(|record| record.state)
            .or_else(|| {
                state
                    .unsubscribes
                    .contains_key(session_id)
                    .then_some(SubscriptionState::Unsubscribing)
            })
    }

    /// Sessions currently holding `full` level.
    pub fn full_sessions(&self) -> Vec<SessionId> {
        self.shared
            .state
            .lock()
            .records
            .iter()
            .filter(|(_, record)| record.level == SubscriptionLevel::Full)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every tracked session.
    pub fn tracked_sessions(&self) -> Vec<SessionId> {
        self.shared.state.lock().records.keys().cloned().collect()
    }

    /// The transport this router drives.
    pub fn transport(&self) -> &StreamTransport {
        &self.shared.transport
    }

    /// Stop routing and forget every subscription. Open session channels
    /// end. The transport itself is left to the caller.
    pub fn shutdown(&self) {
        let unsubscribes = {
            let mut state = self.shared.state.lock();
            if let Some(pump) = state.pump.take() {
                pump.cancel();
            }
            if let Some(resubscribe) = state.resubscribe.take() {
                resubscribe.cancel();
            }
            state.records.clear();
            state.focused = None;
            std::mem::take(&mut state.unsubscribes)
        };
        for (_, pending) in unsubscribes {
            pending.cancel.cancel();
            pending.handle.abort();
        }
        debug!("subscription router shut down");
    }
}

impl RouterShared {
    fn ensure_pump(self: &Arc<Self>) {
        let token = {
            let mut state = self.state.lock();
            let running = state.pump.as_ref().is_some_and(|t| !t.is_cancelled())
                && self.transport.is_active();
            if running {
                None
            } else {
                if let Some(previous) = state.pump.take() {
                    previous.cancel();
                }
                let token = CancellationToken::new();
                state.pump = Some(token.clone());
                Some(token)
            }
        };

        match token {
            Some(token) => {
                let events = self.transport.connect();
                let _ = tokio::spawn(pump(Arc::downgrade(self), events, token));
            }
            None if self.transport.status() == ConnectionStatus::Disconnected => {
                info!("transport gave up earlier, reconnecting");
                let _ = self.transport.reconnect();
            }
            None => {}
        }
    }

    async fn send_subscribe(
        &self,
        session_id: &SessionId,
        level: SubscriptionLevel,
        since_seq: Option<u64>,
    ) -> StreamResult<()> {
        self.registry
            .send_command_within(
                &self.transport,
                command_names::SUBSCRIBE,
                self.config.subscribe_timeout,
                |request_id| ClientCommand::Subscribe {
                    session_id: session_id.clone(),
                    level,
                    request_id,
                    since_seq,
                },
            )
            .await
            .map(|_| ())
    }

    fn mark_subscribed(&self, session_id: &SessionId, generation: u64) -> bool {
        let mut state = self.state.lock();
        match state.records.get_mut(session_id) {
            Some(record) if record.generation == generation => {
                record.state = SubscriptionState::Subscribed(record.level);
                true
            }
            _ => false,
        }
    }

    fn mark_lost(&self, session_id: &SessionId, generation: u64) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.get_mut(session_id) {
            if record.generation == generation {
                record.state = SubscriptionState::Lost;
            }
        }
    }

    fn forget(&self, session_id: &SessionId, generation: u64) {
        let mut state = self.state.lock();
        if state
            .records
            .get(session_id)
            .is_some_and(|record| record.generation == generation)
        {
            let _ = state.records.remove(session_id);
            if state.focused.as_ref() == Some(session_id) {
                state.focused = None;
            }
        }
    }

    /// A session channel was dropped.
    fn release(self: &Arc<Self>, session_id: &SessionId, generation: u64) {
        let released = {
            let mut state = self.state.lock();
            let current = state
                .records
                .get(session_id)
                .is_some_and(|record| record.generation == generation);
            if current {
                let _ = state.records.remove(session_id);
                if state.focused.as_ref() == Some(session_id) {
                    state.focused = None;
                }
            }
            current
        };
        if released {
            debug!(session_id = %session_id, "session stream dropped");
            self.schedule_unsubscribe(session_id.clone());
        }
    }

    fn schedule_unsubscribe(self: &Arc<Self>, session_id: SessionId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cancel = CancellationToken::new();
        let transport = self.transport.clone();
        let registry = self.registry.clone();
        let timeout = self.config.subscribe_timeout;
        let router = Arc::downgrade(self);
        let task = {
            let cancel = cancel.clone();
            let session_id = session_id.clone();
            async move {
                let result = registry
                    .send_command_cancellable(
                        &transport,
                        command_names::UNSUBSCRIBE,
                        timeout,
                        &cancel,
                        |request_id| ClientCommand::Unsubscribe {
                            session_id: session_id.clone(),
                            request_id,
                        },
                    )
                    .await;
                match result {
                    None => debug!(session_id = %session_id, "unsubscribe superseded"),
                    Some(Err(error)) => {
                        debug!(session_id = %session_id, error = %error, "unsubscribe failed");
                    }
                    Some(Ok(_)) => {}
                }
                cancel.cancel();
                if let Some(router) = router.upgrade() {
                    router.prune_unsubscribe(&session_id);
                }
            }
        };

        let mut state = self.state.lock();
        if let Some(previous) = state.unsubscribes.remove(&session_id) {
            previous.cancel.cancel();
        }
        let handle = runtime.spawn(task);
        let _ = state
            .unsubscribes
            .insert(session_id, PendingUnsubscribe { cancel, handle });
    }

    /// Drop the bookkeeping of a finished unsubscribe. A newer pending
    /// unsubscribe for the same session has a live token and is kept.
    fn prune_unsubscribe(&self, session_id: &SessionId) {
        let mut state = self.state.lock();
        if state
            .unsubscribes
            .get(session_id)
            .is_some_and(|pending| pending.cancel.is_cancelled())
        {
            let _ = state.unsubscribes.remove(session_id);
        }
    }

    /// Cancel a pending unsubscribe so it cannot land after a new subscribe.
    async fn cancel_unsubscribe(&self, session_id: &SessionId) {
        let pending = self.state.lock().unsubscribes.remove(session_id);
        if let Some(pending) = pending {
            debug!(session_id = %session_id, "cancelling pending unsubscribe");
            pending.cancel.cancel();
            let _ = pending.handle.await;
        }
    }

    fn spawn_notifications_subscribe(self: &Arc<Self>, session_id: SessionId) {
        let shared = self.clone();
        let _ = tokio::spawn(async move {
            let generation = {
                let state = shared.state.lock();
                match state.records.get(&session_id) {
                    Some(record) if record.level == SubscriptionLevel::Notifications => {
                        record.generation
                    }
                    _ => return,
                }
            };
            let since_seq = shared.since_seq(&session_id);
            match shared
                .send_subscribe(&session_id, SubscriptionLevel::Notifications, since_seq)
                .await
            {
                Ok(()) => {
                    let _ = shared.mark_subscribed(&session_id, generation);
                }
                Err(error) => {
                    warn!(session_id = %session_id, error = %error, "notifications subscribe failed");
                }
            }
        });
    }

    fn since_seq(&self, session_id: &SessionId) -> Option<u64> {
        let tracker = self
            .state
            .lock()
            .records
            .get(session_id)
            .map(|record| record.tracker.clone());
        tracker.and_then(|t| t.lock().last_consumed)
    }

    fn publish(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn route(self: &Arc<Self>, frame: ServerFrame) {
        let signal = frame.signal();
        let matched = self.registry.observe(&frame);

        if signal == InboundSignal::StreamConnected {
            info!("stream (re)connected, resubscribing");
            self.publish(ConnectionEvent::StreamConnected);
            self.start_resubscribe();
            return;
        }
        let Some(session_id) = frame.session_id.clone() else {
            debug!(kind = %frame.kind, "unhandled stream-level frame");
            return;
        };
        if matched && matches!(signal, InboundSignal::CommandResult(_)) {
            return;
        }

        let (tx, tracker, focused) = {
            let state = self.state.lock();
            let focused = state.focused.as_ref() == Some(&session_id);
            match state.records.get(&session_id) {
                Some(record) => (record.tx.clone(), Some(record.tracker.clone()), focused),
                None => (None, None, focused),
            }
        };

        if let Some(hook) = &self.frame_hook {
            hook(&frame, focused);
        }

        let duplicate = match (frame.seq_meta(), &tracker) {
            (Some(meta), Some(tracker)) => !tracker.lock().admit(meta),
            _ => false,
        };
        if duplicate {
            debug!(session_id = %session_id, seq = ?frame.seq, "dropping replayed frame");
            return;
        }

        if !focused {
            self.publish(ConnectionEvent::CrossSession(frame.clone()));
        }
        if let Some(tx) = tx {
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::counter!(telemetry::STREAM_FRAMES_DROPPED_TOTAL, "reason" => "backpressure")
                        .increment(1);
                    warn!(session_id = %session_id, "session channel full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session_id = %session_id, "session channel closed");
                }
            }
        }
    }

    fn connection_lost(&self, reason: String, will_reconnect: bool) {
        let failed = self.registry.fail_all(&StreamError::NotConnected);
        {
            let mut state = self.state.lock();
            if let Some(resubscribe) = state.resubscribe.take() {
                resubscribe.cancel();
            }
            for record in state.records.values_mut() {
                if matches!(record.state, SubscriptionState::Subscribed(_)) {
                    record.state = SubscriptionState::Lost;
                }
            }
        }
        warn!(%reason, will_reconnect, failed, "stream connection lost");
        self.publish(ConnectionEvent::ConnectionLost { reason });
    }

    fn start_resubscribe(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.resubscribe.replace(cancel.clone()) {
                previous.cancel();
            }
        }
        let shared = self.clone();
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => debug!("resubscription superseded"),
                () = shared.resubscribe_all() => {}
            }
        });
    }

    async fn resubscribe_all(self: &Arc<Self>) {
        let (focused, others) = {
            let state = self.state.lock();
            let mut focused = None;
            let mut others = Vec::new();
            for (id, record) in &state.records {
                if record.state == SubscriptionState::Subscribing {
                    continue;
                }
                let target = (id.clone(), record.generation);
                if state.focused.as_ref() == Some(id) {
                    focused = Some(target);
                } else {
                    others.push(target);
                }
            }
            (focused, others)
        };
        if focused.is_none() && others.is_empty() {
            return;
        }
        debug!(focused = focused.is_some(), others = others.len(), "resubscribing sessions");

        let focused_task = async {
            if let Some((session_id, generation)) = focused {
                self.resubscribe_focused(session_id, generation).await;
            }
        };
        let others_task = futures::future::join_all(
            others
                .into_iter()
                .map(|(session_id, generation)| self.resubscribe_background(session_id, generation)),
        );
        let ((), _) = tokio::join!(focused_task, others_task);
    }

    async fn resubscribe_focused(&self, session_id: SessionId, generation: u64) {
        let attempts = self.config.resubscribe_attempts.max(1);
        let mut last_error = StreamError::NotConnected;
        for attempt in 1..=attempts {
            if !self.is_current(&session_id, generation) {
                return;
            }
            let since_seq = self.since_seq(&session_id);
            match self
                .send_subscribe(&session_id, SubscriptionLevel::Full, since_seq)
                .await
            {
                Ok(()) => {
                    let _ = self.mark_subscribed(&session_id, generation);
                    info!(session_id = %session_id, attempt, "focused session resubscribed");
                    return;
                }
                Err(error) => {
                    warn!(session_id = %session_id, attempt, error = %error, "focused resubscribe failed");
                    last_error = error;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.resubscribe_backoff_step * attempt).await;
            }
        }
        if self.is_current(&session_id, generation) {
            self.mark_lost(&session_id, generation);
            self.publish(ConnectionEvent::ResubscribeFailed {
                session_id,
                error: last_error,
            });
        }
    }

    async fn resubscribe_background(&self, session_id: SessionId, generation: u64) {
        let since_seq = self.since_seq(&session_id);
        match self
            .send_subscribe(&session_id, SubscriptionLevel::Notifications, since_seq)
            .await
        {
            Ok(()) => {
                let mut state = self.state.lock();
                if let Some(record) = state.records.get_mut(&session_id) {
                    if record.generation == generation {
                        record.level = SubscriptionLevel::Notifications;
                        record.state = SubscriptionState::Subscribed(record.level);
                    }
                }
            }
            Err(error) => {
                self.mark_lost(&session_id, generation);
                warn!(session_id = %session_id, error = %error, "background resubscribe failed");
            }
        }
    }

    fn is_current(&self, session_id: &SessionId, generation: u64) -> bool {
        self.state
            .lock()
            .records
            .get(session_id)
            .is_some_and(|record| record.generation == generation)
    }

    /// Clear the pump slot unless a newer pump has replaced it.
    fn pump_finished(&self) {
        let mut state = self.state.lock();
        if state.pump.as_ref().is_some_and(CancellationToken::is_cancelled) {
            let _ = state.pump.take();
        }
    }
}

async fn pump(router: Weak<RouterShared>, mut events: TransportEvents, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = events.next() => event,
        };
        let Some(event) = event else {
            break;
        };
        let Some(shared) = router.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Frame(frame) => shared.route(frame),
            TransportEvent::Disconnected {
                reason,
                will_reconnect,
            } => shared.connection_lost(reason, will_reconnect),
        }
    }
    debug!("inbound sequence ended");
    cancel.cancel();
    if let Some(shared) = router.upgrade() {
        shared.pump_finished();
    }
}

/// Ordered frames for one session. Dropping it unsubscribes, unless the
/// session has been re-streamed since.
pub struct SessionStream {
    session_id: SessionId,
    rx: mpsc::Receiver<ServerFrame>,
    tracker: Arc<Mutex<SeqTracker>>,
    router: Weak<RouterShared>,
    generation: u64,
}

impl SessionStream {
    /// Session this stream belongs to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next frame; `None` once the subscription ends.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        let frame = self.rx.recv().await?;
        self.consumed(&frame);
        Some(frame)
    }

    /// Highest sequence number pulled so far.
    pub fn last_consumed_seq(&self) -> Option<u64> {
        self.tracker.lock().last_consumed
    }

    /// Highest sequence number the server has reported for this session.
    pub fn server_head_seq(&self) -> Option<u64> {
        self.tracker.lock().server_head
    }

    /// Events the server holds that this stream has not pulled yet.
    pub fn backlog(&self) -> u64 {
        let tracker = self.tracker.lock();
        match (tracker.server_head, tracker.last_consumed) {
            (Some(head), Some(consumed)) => head.saturating_sub(consumed),
            (Some(head), None) => head,
            (None, _) => 0,
        }
    }

    fn consumed(&self, frame: &ServerFrame) {
        if let Some(seq) = frame.seq {
            self.tracker.lock().consumed(seq);
        }
    }
}

impl Stream for SessionStream {
    type Item = ServerFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.rx.poll_recv(cx);
        if let Poll::Ready(Some(frame)) = &polled {
            this.consumed(frame);
        }
        polled
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.release(&self.session_id, self.generation);
        }
    }
}

impl std::fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStream")
            .field("session_id", &self.session_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
