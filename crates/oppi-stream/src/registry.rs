//! Command correlation registry.
//!
//! Tracks outbound requests awaiting a reply, keyed by request ID. Replies
//! may arrive out of order, before the sender starts waiting, or in several
//! stages; every pending record resolves exactly once through its
//! [`Waiter`]:
//!
//! - **Turn sends** (`prompt`, `steer`, `follow_up`) resolve once a
//!   `turn_ack` reports a stage at or past the required threshold, or on a
//!   flat `command_result` when no stage has been seen (older servers).
//!   A failed `command_result` rejects with the server's reason verbatim.
//! - **One-shot commands** resolve on their `command_result`.
//! - Each wait races a timer task. When the timer wins it resolves the
//!   waiter in-band, so nothing is ever left parked.
//! - [`CommandRegistry::fail_all`] resolves every pending record in one
//!   pass and clears the maps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oppi_core::errors::{StreamError, StreamResult};
use oppi_core::protocol::{ClientCommand, CommandResult, InboundSignal, ServerFrame, TurnAck, TurnStage};
use oppi_core::{RequestId, TurnId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::telemetry;
use crate::waiter::Waiter;

/// Where the registry writes outbound commands.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Encode and send one command.
    async fn dispatch(&self, command: &ClientCommand) -> StreamResult<()>;
}

/// Called synchronously on every stage reported for a turn.
pub type StageObserver = Arc<dyn Fn(&TurnStage) + Send + Sync>;

/// Identifiers handed to the payload factory for one turn attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnAttempt {
    /// Fresh per attempt.
    pub request_id: RequestId,
    /// Stable across attempts of the same turn.
    pub turn_id: TurnId,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Successful turn send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Request ID of the attempt that was acknowledged.
    pub request_id: RequestId,
    /// Idempotency token of the turn.
    pub turn_id: TurnId,
    /// Stage that satisfied the threshold; `None` for a flat success.
    pub stage: Option<TurnStage>,
    /// Attempts used.
    pub attempts: u32,
}

type TurnWaiter = Arc<Waiter<StreamResult<Option<TurnStage>>>>;
type CommandWaiter = Arc<Waiter<StreamResult<Option<Value>>>>;

struct PendingTurn {
    command: String,
    turn_id: Option<TurnId>,
    latest_stage: Option<TurnStage>,
    observer: Option<StageObserver>,
    waiter: TurnWaiter,
}

struct PendingCommand {
    command: String,
    waiter: CommandWaiter,
}

#[derive(Default)]
struct Pending {
    turns: HashMap<RequestId, PendingTurn>,
    turn_index: HashMap<TurnId, RequestId>,
    commands: HashMap<RequestId, PendingCommand>,
}

impl Pending {
    fn contains(&self, request_id: &RequestId) -> bool {
        self.turns.contains_key(request_id) || self.commands.contains_key(request_id)
    }
}

enum Resolution {
    Turn(TurnWaiter, StreamResult<Option<TurnStage>>),
    Command(CommandWaiter, StreamResult<Option<Value>>),
    Ignored,
}

/// Request-ID-keyed map of in-flight commands.
pub struct CommandRegistry {
    config: RegistryConfig,
    pending: Mutex<Pending>,
}

impl CommandRegistry {
    /// Empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Send a staged turn command and wait for its acknowledgement.
    ///
    /// `make` builds the command for each attempt. Attempts share one turn
    /// ID; each gets a fresh request ID. Retries happen only for
    /// [`StreamError::is_retryable_turn_failure`] errors, after
    /// `turn_retry_delay`, up to `turn_max_attempts` in total.
    pub async fn send_turn_command<S, F>(
        &self,
        sink: &S,
        command: &str,
        mut make: F,
        observer: Option<StageObserver>,
    ) -> StreamResult<TurnOutcome>
    where
        S: CommandSink + ?Sized,
        F: FnMut(TurnAttempt) -> ClientCommand + Send,
    {
        let turn_id = TurnId::new();
        let max_attempts = self.config.turn_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outbound = make(TurnAttempt {
                request_id: RequestId::new(),
                turn_id: turn_id.clone(),
                attempt,
            });
            match self.attempt_turn(sink, command, &outbound, observer.clone()).await {
                Ok(stage) => {
                    return Ok(TurnOutcome {
                        request_id: outbound.request_id().clone(),
                        turn_id: turn_id_of(&outbound).cloned().unwrap_or(turn_id),
                        stage,
                        attempts: attempt,
                    });
                }
                Err(error) if attempt < max_attempts && error.is_retryable_turn_failure() => {
                    warn!(command, attempt, error = %error, "turn send failed, retrying");
                    tokio::time::sleep(self.config.turn_retry_delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    debug!(command, attempt, error = %error, "turn send failed");
                    return Err(error);
                }
            }
        }
    }

    /// Send a one-shot command and wait up to `command_timeout` for its
    /// result. Returns the result's `data`, if any.
    pub async fn send_command<S, F>(
        &self,
        sink: &S,
        command: &str,
        make: F,
    ) -> StreamResult<Option<Value>>
    where
        S: CommandSink + ?Sized,
        F: FnOnce(RequestId) -> ClientCommand + Send,
    {
        self.send_command_within(sink, command, self.config.command_timeout, make)
            .await
    }

    /// [`send_command`](Self::send_command) with an explicit timeout.
    pub async fn send_command_within<S, F>(
        &self,
        sink: &S,
        command: &str,
        timeout: Duration,
        make: F,
    ) -> StreamResult<Option<Value>>
    where
        S: CommandSink + ?Sized,
        F: FnOnce(RequestId) -> ClientCommand + Send,
    {
        let (outbound, waiter, _guard) = self.register_command(command, make)?;
        sink.dispatch(&outbound).await?;
        self.await_reply(&waiter, timeout, command).await
    }

    /// [`send_command_within`](Self::send_command_within) that stops
    /// waiting for the reply once `cancel` fires. Returns `None` when
    /// cancelled. A write that has started is always finished, so the
    /// command never reaches the socket after the canceller's next write.
    pub async fn send_command_cancellable<S, F>(
        &self,
        sink: &S,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        make: F,
    ) -> Option<StreamResult<Option<Value>>>
    where
        S: CommandSink + ?Sized,
        F: FnOnce(RequestId) -> ClientCommand + Send,
    {
        if cancel.is_cancelled() {
            return None;
        }
        let (outbound, waiter, _guard) = match self.register_command(command, make) {
            Ok(registered) => registered,
            Err(error) => return Some(Err(error)),
        };
        if let Err(error) = sink.dispatch(&outbound).await {
            return Some(Err(error));
        }
        tokio::select! {
            () = cancel.cancelled() => None,
            result = self.await_reply(&waiter, timeout, command) => Some(result),
        }
    }

    fn register_command<F>(
        &self,
        command: &str,
        make: F,
    ) -> StreamResult<(ClientCommand, CommandWaiter, PendingGuard<'_>)>
    where
        F: FnOnce(RequestId) -> ClientCommand,
    {
        let outbound = make(RequestId::new());
        let request_id = outbound.request_id().clone();
        let waiter: CommandWaiter = Arc::new(Waiter::new());
        {
            let mut pending = self.pending.lock();
            if pending.contains(&request_id) {
                return Err(duplicate(&request_id));
            }
            let _ = pending.commands.insert(
                request_id.clone(),
                PendingCommand {
                    command: command.to_owned(),
                    waiter: waiter.clone(),
                },
            );
        }
        Ok((outbound, waiter, PendingGuard::new(self, request_id)))
    }

    async fn attempt_turn<S>(
        &self,
        sink: &S,
        command: &str,
        outbound: &ClientCommand,
        observer: Option<StageObserver>,
    ) -> StreamResult<Option<TurnStage>>
    where
        S: CommandSink + ?Sized,
    {
        let request_id = outbound.request_id().clone();
        let turn_id = turn_id_of(outbound).cloned();
        let waiter: TurnWaiter = Arc::new(Waiter::new());
        {
            let mut pending = self.pending.lock();
            if pending.contains(&request_id) {
                return Err(duplicate(&request_id));
            }
            if let Some(turn_id) = &turn_id {
                let _ = pending
                    .turn_index
                    .insert(turn_id.clone(), request_id.clone());
            }
            let _ = pending.turns.insert(
                request_id.clone(),
                PendingTurn {
                    command: command.to_owned(),
                    turn_id,
                    latest_stage: None,
                    observer,
                    waiter: waiter.clone(),
                },
            );
        }
        let _guard = PendingGuard::new(self, request_id);

        sink.dispatch(outbound).await?;
        self.await_reply(&waiter, self.config.turn_timeout, command)
            .await
    }

    /// Wait for `waiter`, racing a timer that resolves it with a timeout.
    async fn await_reply<T>(
        &self,
        waiter: &Arc<Waiter<StreamResult<T>>>,
        timeout: Duration,
        command: &str,
    ) -> StreamResult<T>
    where
        T: Send + 'static,
    {
        let timer = {
            let waiter = waiter.clone();
            let command = command.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if waiter.resolve(Err(StreamError::timeout(command.clone()))) {
                    metrics::counter!(telemetry::COMMAND_TIMEOUTS_TOTAL, "command" => command.clone())
                        .increment(1);
                    warn!(command, ?timeout, "no reply before timeout");
                }
            })
        };
        let _timer = AbortOnDrop(timer);
        waiter.wait().await.unwrap_or(Err(StreamError::NotConnected))
    }

    /// Feed an inbound frame. Returns `true` if it matched a pending record.
    pub fn observe(&self, frame: &ServerFrame) -> bool {
        match frame.signal() {
            InboundSignal::CommandResult(result) => self.handle_command_result(&result),
            InboundSignal::TurnAck(ack) => self.handle_turn_ack(&ack),
            InboundSignal::StreamConnected | InboundSignal::Event => false,
        }
    }

    /// Apply a stage report to its turn.
    pub fn handle_turn_ack(&self, ack: &TurnAck) -> bool {
        let (observer, waiter) = {
            let mut pending = self.pending.lock();
            let key = ack
                .request_id
                .clone()
                .filter(|id| pending.turns.contains_key(id))
                .or_else(|| {
                    ack.turn_id
                        .as_ref()
                        .and_then(|turn_id| pending.turn_index.get(turn_id).cloned())
                });
            let Some(key) = key else {
                return false;
            };
            let Some(turn) = pending.turns.get_mut(&key) else {
                return false;
            };
            if turn.waiter.is_resolved() {
                debug!(stage = %ack.stage, "ignoring stage for settled turn");
                return true;
            }
            turn.latest_stage = Some(ack.stage.clone());
            let reached = ack.stage.reaches(&self.config.required_stage);
            (turn.observer.clone(), reached.then(|| turn.waiter.clone()))
        };

        if let Some(observer) = observer {
            observer(&ack.stage);
        }
        if let Some(waiter) = waiter {
            let _ = waiter.resolve(Ok(Some(ack.stage.clone())));
        }
        true
    }

    /// Apply a flat result to its turn or command.
    pub fn handle_command_result(&self, result: &CommandResult) -> bool {
        let Some(request_id) = result.request_id.as_ref() else {
            return false;
        };
        let resolution = {
            let pending = self.pending.lock();
            if let Some(turn) = pending.turns.get(request_id) {
                if turn.waiter.is_resolved() {
                    Resolution::Ignored
                } else if !result.success {
                    Resolution::Turn(
                        turn.waiter.clone(),
                        Err(StreamError::rejected(turn.command.clone(), result.error.clone())),
                    )
                } else if turn.latest_stage.is_none() {
                    Resolution::Turn(turn.waiter.clone(), Ok(None))
                } else {
                    debug!(command = %turn.command, "flat success after stage report, waiting for threshold");
                    Resolution::Ignored
                }
            } else if let Some(cmd) = pending.commands.get(request_id) {
                let outcome = if result.success {
                    Ok(result.data.clone())
                } else {
                    Err(StreamError::rejected(cmd.command.clone(), result.error.clone()))
                };
                Resolution::Command(cmd.waiter.clone(), outcome)
            } else {
                return false;
            }
        };

        match resolution {
            Resolution::Turn(waiter, outcome) => {
                let _ = waiter.resolve(outcome);
            }
            Resolution::Command(waiter, outcome) => {
                let _ = waiter.resolve(outcome);
            }
            Resolution::Ignored => {}
        }
        true
    }

    /// Resolve every pending record with `error` and clear the registry.
    /// Returns how many records were failed.
    pub fn fail_all(&self, error: &StreamError) -> usize {
        let drained = std::mem::take(&mut *self.pending.lock());
        let count = drained.turns.len() + drained.commands.len();
        for turn in drained.turns.into_values() {
            let _ = turn.waiter.resolve(Err(error.clone()));
        }
        for cmd in drained.commands.into_values() {
            let _ = cmd.waiter.resolve(Err(error.clone()));
        }
        if count > 0 {
            info!(count, error = %error, "failed all pending commands");
        }
        count
    }

    /// Number of pending records.
    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock();
        pending.turns.len() + pending.commands.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending_count() == 0
    }

    /// Last stage reported for a pending turn.
    pub fn latest_stage(&self, request_id: &RequestId) -> Option<TurnStage> {
        self.pending
            .lock()
            .turns
            .get(request_id)
            .and_then(|turn| turn.latest_stage.clone())
    }

    fn remove(&self, request_id: &RequestId) {
        let mut pending = self.pending.lock();
        if let Some(turn) = pending.turns.remove(request_id) {
            if let Some(turn_id) = turn.turn_id {
                if pending.turn_index.get(&turn_id) == Some(request_id) {
                    let _ = pending.turn_index.remove(&turn_id);
                }
            }
        }
        let _ = pending.commands.remove(request_id);
    }
}

/// Removes a pending record when its sender finishes or is dropped.
struct PendingGuard<'a> {
    registry: &'a CommandRegistry,
    request_id: RequestId,
}

impl<'a> PendingGuard<'a> {
    fn new(registry: &'a CommandRegistry, request_id: RequestId) -> Self {
        Self {
            registry,
            request_id,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.request_id);
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn turn_id_of(command: &ClientCommand) -> Option<&TurnId> {
    match command {
        ClientCommand::Prompt(p) | ClientCommand::Steer(p) | ClientCommand::FollowUp(p) => {
            Some(&p.turn_id)
        }
        _ => None,
    }
}

fn duplicate(request_id: &RequestId) -> StreamError {
    StreamError::Transport(format!("request {request_id} is already pending"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use oppi_core::protocol::{TurnKind, TurnPayload};
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct FakeSink {
        sent: mpsc::UnboundedSender<ClientCommand>,
        failures: Mutex<VecDeque<StreamError>>,
    }

    impl FakeSink {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ClientCommand>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    sent: tx,
                    failures: Mutex::new(VecDeque::new()),
                }),
                rx,
            )
        }

        fn fail_next(&self, error: StreamError) {
            self.failures.lock().push_back(error);
        }
    }

    #[async_trait]
    impl CommandSink for FakeSink {
        async fn dispatch(&self, command: &ClientCommand) -> StreamResult<()> {
            if let Some(error) = self.failures.lock().pop_front() {
                return Err(error);
            }
            let _ = self.sent.send(command.clone());
            Ok(())
        }
    }

    fn prompt(message: &str) -> impl FnMut(TurnAttempt) -> ClientCommand + Send + 'static {
        let message = message.to_owned();
        move |attempt| {
            TurnKind::Prompt.into_command(TurnPayload {
                message: message.clone(),
                images: Vec::new(),
                request_id: attempt.request_id,
                turn_id: attempt.turn_id,
            })
        }
    }

    fn ack(cmd: &ClientCommand, stage: &str) -> ServerFrame {
        let turn_id = turn_id_of(cmd).map(|t| t.to_string());
        ServerFrame::decode(
            &json!({
                "type": "turn_ack",
                "command": cmd.name(),
                "requestId": cmd.request_id(),
                "turnId": turn_id,
                "stage": stage,
            })
            .to_string(),
        )
        .unwrap()
    }

    fn result(cmd: &ClientCommand, success: bool, error: Option<&str>) -> ServerFrame {
        ServerFrame::decode(
            &json!({
                "type": "command_result",
                "command": cmd.name(),
                "requestId": cmd.request_id(),
                "success": success,
                "error": error,
                "data": {"ok": success},
            })
            .to_string(),
        )
        .unwrap()
    }

    fn registry() -> Arc<CommandRegistry> {
        Arc::new(CommandRegistry::new(RegistryConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn turn_resolves_at_required_stage_not_before() {
        let registry = registry();
        let (sink, mut sent) = FakeSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: StageObserver = {
            let seen = seen.clone();
            Arc::new(move |stage: &TurnStage| seen.lock().push(stage.clone()))
        };

        let task = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry
                    .send_turn_command(&*sink, "prompt", prompt("hi"), Some(observer))
                    .await
            })
        };
        let cmd = sent.recv().await.unwrap();

        assert!(registry.observe(&ack(&cmd, "queued")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());
        assert_eq!(registry.latest_stage(cmd.request_id()), Some(TurnStage::Queued));

        assert!(registry.observe(&ack(&cmd, "dispatched")));
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.stage, Some(TurnStage::Dispatched));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(&outcome.request_id, cmd.request_id());
        assert_eq!(*seen.lock(), vec![TurnStage::Queued, TurnStage::Dispatched]);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flat_success_without_stages_counts_as_ack() {
        let registry = registry();
        let (sink, mut sent) = FakeSink::new();
        let task = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry.send_turn_command(&*sink, "prompt", prompt("hi"), None).await
            })
        };
        let cmd = sent.recv().await.unwrap();
        assert!(registry.observe(&result(&cmd, true, None)));
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.stage, None);
    }

    #[tokio::test(start_paused = true)]
    async fn flat_success_after_a_stage_waits_for_threshold() {
        let registry = registry();
        let (sink, mut sent) = FakeSink::new();
        let task = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry.send_turn_command(&*sink, "prompt", prompt("hi"), None).await
            })
        };
        let cmd = sent.recv().await.unwrap();
        let _ = registry.observe(&ack(&cmd, "queued"));
        let _ = registry.observe(&result(&cmd, true, None));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        let _ = registry.observe(&ack(&cmd, "accepted"));
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.stage, Some(TurnStage::Accepted));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_carries_reason_and_is_not_retried() {
        let registry = registry();
        let (sink, mut sent) = FakeSink::new();
        let task = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry.send_turn_command(&*sink, "steer", prompt("x"), None).await
            })
        };
        let cmd = sent.recv().await.unwrap();
        let _ = registry.observe(&result(&cmd, false, Some("Session is not busy")));
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            StreamError::rejected("steer", Some("Session is not busy".into()))
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sent.try_recv().is_err(), "rejection must not be retried");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_retries_once_with_same_turn_id() {
        let registry = registry();
        let (sink, mut sent) = FakeSink::new();
        let started = Instant::now();
        let task = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry.send_turn_command(&*sink, "prompt", prompt("hi"), None).await
            })
        };
        let first = sent.recv().await.unwrap();
        let second = sent.recv().await.unwrap();
        assert_ne!(first.request_id(), second.request_id());
        assert_eq!(turn_id_of(&first), turn_id_of(&second));

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err, StreamError::timeout("prompt"));
        assert_eq!(started.elapsed(), Duration::from_millis(8_250));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn not_connected_dispatch_is_retried() {
        let registry = registry();
        let (sink, mut sent) = FakeSink::new();
        sink.fail_next(StreamError::NotConnected);
        let task = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry.send_turn_command(&*sink, "prompt", prompt("hi"), None).await
            })
        };
        let cmd = sent.recv().await.unwrap();
        let _ = registry.observe(&ack(&cmd, "dispatched"));
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_without_request_id_matches_by_turn_id() {
        let registry = registry();
        let (sink, mut sent) = FakeSink::new();
        let task = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry.send_turn_command(&*sink, "prompt", prompt("hi"), None).await
            })
        };
        let cmd = sent.recv().await.unwrap();
        let turn_id = turn_id_of(&cmd).unwrap().clone();
        let frame = ServerFrame::decode(
            &json!({"type": "turn_ack", "turnId": turn_id, "stage": "dispatched"}).to_string(),
        )
        .unwrap();
        assert!(registry.observe(&frame));
        assert_eq!(task.await.unwrap().unwrap().turn_id, turn_id);
    }

    #[tokio::test(start_paused = true)]
    async fn command_returns_result_data() {
        let registry = registry();
        let (sink, mut sent) = FakeSink::new();
        let task = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry
                    .send_command(&*sink, "get_state", |request_id| ClientCommand::GetState {
                        request_id,
                    })
                    .await
            })
        };
        let cmd = sent.recv().await.unwrap();
        let _ = registry.observe(&result(&cmd, true, None));
        assert_eq!(task.await.unwrap().unwrap(), Some(json!({"ok": true})));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_command_times_out_after_default() {
        let registry = registry();
        let (sink, _sent) = FakeSink::new();
        let started = Instant::now();
        let err = registry
            .send_command(&*sink, "get_fork_messages", |request_id| {
                ClientCommand::Generic {
                    name: "get_fork_messages".into(),
                    request_id,
                    params: serde_json::Map::new(),
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err, StreamError::timeout("get_fork_messages"));
        assert_eq!(started.elapsed(), Duration::from_secs(8));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn result_arriving_before_wait_is_delivered() {
        let registry = registry();
        // Answer from inside dispatch, before the sender starts waiting.
        struct EagerSink {
            registry: Arc<CommandRegistry>,
        }
        #[async_trait]
        impl CommandSink for EagerSink {
            async fn dispatch(&self, command: &ClientCommand) -> StreamResult<()> {
                let _ = self.registry.observe(&result(command, true, None));
                Ok(())
            }
        }
        let eager = EagerSink {
            registry: registry.clone(),
        };
        let data = registry
            .send_command(&eager, "get_state", |request_id| ClientCommand::GetState {
                request_id,
            })
            .await
            .unwrap();
        assert_eq!(data, Some(json!({"ok": true})));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_all_resolves_every_pending_record() {
        let registry = Arc::new(CommandRegistry::new(RegistryConfig {
            turn_max_attempts: 1,
            ..RegistryConfig::default()
        }));
        let (sink, mut sent) = FakeSink::new();

        let mut tasks = Vec::new();
        for i in 0..3 {
            let (registry, sink) = (registry.clone(), sink.clone());
            tasks.push(tokio::spawn(async move {
                registry
                    .send_turn_command(&*sink, "prompt", prompt(&format!("t{i}")), None)
                    .await
                    .map(|_| ())
            }));
        }
        for _ in 0..2 {
            let (registry, sink) = (registry.clone(), sink.clone());
            tasks.push(tokio::spawn(async move {
                registry
                    .send_command(&*sink, "get_state", |request_id| ClientCommand::GetState {
                        request_id,
                    })
                    .await
                    .map(|_| ())
            }));
        }
        for _ in 0..5 {
            let _ = sent.recv().await.unwrap();
        }
        assert_eq!(registry.pending_count(), 5);

        assert_eq!(registry.fail_all(&StreamError::NotConnected), 5);
        assert!(registry.is_empty());
        for task in tasks {
            assert_eq!(task.await.unwrap(), Err(StreamError::NotConnected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_win_still_resolves_the_waiter() {
        let registry = registry();
        let waiter: CommandWaiter = Arc::new(Waiter::new());
        let result = registry
            .await_reply(&waiter, Duration::from_secs(1), "get_state")
            .await;
        assert_eq!(result, Err(StreamError::timeout("get_state")));
        assert!(waiter.is_resolved());
        assert!(!waiter.resolve(Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn late_signals_for_settled_turn_are_ignored() {
        let registry = registry();
        let (sink, mut sent) = FakeSink::new();
        let calls = Arc::new(Mutex::new(0usize));
        let observer: StageObserver = {
            let calls = calls.clone();
            Arc::new(move |_: &TurnStage| *calls.lock() += 1)
        };
        let task = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry
                    .send_turn_command(&*sink, "prompt", prompt("hi"), Some(observer))
                    .await
            })
        };
        let cmd = sent.recv().await.unwrap();
        let _ = registry.observe(&result(&cmd, true, None));
        // Arrives before the sender wakes and removes the record.
        let _ = registry.observe(&ack(&cmd, "dispatched"));
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.stage, None);
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn unrelated_frames_are_not_matched() {
        let registry = registry();
        let frame = ServerFrame::decode(r#"{"type":"agent_start","sessionId":"s1"}"#).unwrap();
        assert!(!registry.observe(&frame));
        let orphan =
            ServerFrame::decode(r#"{"type":"command_result","requestId":"nope","success":true}"#)
                .unwrap();
        assert!(!registry.observe(&orphan));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_leaves_nothing_pending() {
        let registry = registry();
        let (sink, mut sent) = FakeSink::new();
        let command = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry
                    .send_command(&*sink, "get_state", |request_id| ClientCommand::GetState {
                        request_id,
                    })
                    .await
            })
        };
        let turn = {
            let (registry, sink) = (registry.clone(), sink.clone());
            tokio::spawn(async move {
                registry.send_turn_command(&*sink, "prompt", prompt("hi"), None).await
            })
        };
        let _ = sent.recv().await.unwrap();
        let _ = sent.recv().await.unwrap();
        assert_eq!(registry.pending_count(), 2);

        command.abort();
        turn.abort();
        assert!(command.await.unwrap_err().is_cancelled());
        assert!(turn.await.unwrap_err().is_cancelled());
        assert!(registry.is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.is_empty());
        assert!(sent.try_recv().is_err(), "no retry after cancel");
    }
}
