//! Liveness watchdog for the focused session.
//!
//! Detects a zombie connection: the socket still answers pings but no
//! application frames arrive. Armed while a session is busy; every inbound
//! event for it calls [`LivenessWatchdog::touch`].
//!
//! ```text
//! idle ──arm──► armed ──silence ≥ probe──► probed ──silence ≥ reconnect──► idle
//!                 ▲                          │        (reconnect fired once)
//!                 └────────── touch ─────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oppi_core::SessionId;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::WatchdogConfig;

/// What a tick decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Keep waiting.
    None,
    /// Send a lightweight state request.
    Probe,
    /// Give up on the connection.
    Reconnect,
}

/// Decide the action for `silence` since the last event.
pub fn evaluate(silence: Duration, probed: bool, config: &WatchdogConfig) -> WatchdogAction {
    if silence >= config.reconnect_timeout {
        WatchdogAction::Reconnect
    } else if silence >= config.probe_interval && !probed {
        WatchdogAction::Probe
    } else {
        WatchdogAction::None
    }
}

/// Recovery actions the watchdog escalates to. Implementations should return
/// promptly; long work belongs in a spawned task.
#[async_trait]
pub trait LivenessDelegate: Send + Sync + 'static {
    /// Ask the server for state to tell a thinking agent from a dead socket.
    async fn probe(&self, session_id: &SessionId);
    /// The session has been silent past the reconnect timeout.
    async fn reconnect(&self, session_id: &SessionId);
}

struct Armed {
    session_id: SessionId,
    last_event: Instant,
    probed: bool,
    cancel: CancellationToken,
}

struct Shared {
    config: WatchdogConfig,
    delegate: Arc<dyn LivenessDelegate>,
    armed: Mutex<Option<Armed>>,
}

/// Per-connection watchdog. At most one session is watched at a time.
#[derive(Clone)]
pub struct LivenessWatchdog {
    shared: Arc<Shared>,
}

impl LivenessWatchdog {
    /// Idle watchdog.
    pub fn new(config: WatchdogConfig, delegate: Arc<dyn LivenessDelegate>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                delegate,
                armed: Mutex::new(None),
            }),
        }
    }

    /// Start watching `session_id`. Re-arming the watched session only
    /// resets its clock; arming another session replaces the loop.
    pub fn arm(&self, session_id: &SessionId) {
        let cancel = {
            let mut armed = self.shared.armed.lock();
            if let Some(current) = armed.as_mut() {
                if &current.session_id == session_id {
                    current.last_event = Instant::now();
                    current.probed = false;
                    return;
                }
                current.cancel.cancel();
            }
            let cancel = CancellationToken::new();
            *armed = Some(Armed {
                session_id: session_id.clone(),
                last_event: Instant::now(),
                probed: false,
                cancel: cancel.clone(),
            });
            cancel
        };
        debug!(session_id = %session_id, "watchdog armed");
        let _ = tokio::spawn(run(self.shared.clone(), session_id.clone(), cancel));
    }

    /// Record a meaningful inbound event for `session_id`.
    pub fn touch(&self, session_id: &SessionId) {
        if let Some(armed) = self.shared.armed.lock().as_mut() {
            if &armed.session_id == session_id {
                armed.last_event = Instant::now();
                armed.probed = false;
            }
        }
    }

    /// Cancel the loop and clear state.
    pub fn stop(&self) {
        if let Some(armed) = self.shared.armed.lock().take() {
            armed.cancel.cancel();
            debug!(session_id = %armed.session_id, "watchdog stopped");
        }
    }

    /// Stop only if `session_id` is the watched session.
    pub fn stop_for(&self, session_id: &SessionId) {
        let mut armed = self.shared.armed.lock();
        if armed.as_ref().is_some_and(|a| &a.session_id == session_id) {
            if let Some(armed) = armed.take() {
                armed.cancel.cancel();
            }
        }
    }

    /// Session being watched, if any.
    pub fn armed_session(&self) -> Option<SessionId> {
        self.shared.armed.lock().as_ref().map(|a| a.session_id.clone())
    }

    /// Whether a session is being watched.
    pub fn is_armed(&self) -> bool {
        self.shared.armed.lock().is_some()
    }
}

async fn run(shared: Arc<Shared>, session_id: SessionId, cancel: CancellationToken) {
    let period = shared.config.probe_interval.max(Duration::from_millis(1));
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticks.tick() => {}
        }

        let action = {
            let mut armed = shared.armed.lock();
            let Some(current) = armed.as_mut() else {
                return;
            };
            if current.session_id != session_id || current.cancel.is_cancelled() {
                return;
            }
            let silence = current.last_event.elapsed();
            let action = evaluate(silence, current.probed, &shared.config);
            match action {
                WatchdogAction::Probe => current.probed = true,
                WatchdogAction::Reconnect => *armed = None,
                WatchdogAction::None => {}
            }
            action
        };

        match action {
            WatchdogAction::Probe => {
                debug!(session_id = %session_id, "session silent, probing");
                shared.delegate.probe(&session_id).await;
            }
            WatchdogAction::Reconnect => {
                warn!(session_id = %session_id, "session silent past reconnect timeout");
                shared.delegate.reconnect(&session_id).await;
                return;
            }
            WatchdogAction::None => {}
        }
    }
}
