//! Single-resolution result holder.
//!
//! A [`Waiter`] bridges an asynchronous event (a reply routed from the
//! receive loop, a timer, a bulk teardown) to one await point. Both entry
//! points handle either ordering:
//!
//! | state        | `resolve(v)`                 | `wait()`                       |
//! |--------------|------------------------------|--------------------------------|
//! | `Empty`      | buffer `v`                   | park, become `Waiting`         |
//! | `Buffered`   | ignored                      | take the value immediately     |
//! | `Waiting`    | hand `v` to the parked waiter| second waiter gets `None`      |
//! | `Resolved`   | ignored                      | `None`                         |
//!
//! The lock is only held for the state transition, never across an await,
//! so `resolve` is safe to call from any task or thread.

use std::time::Duration;

use oppi_core::errors::{StreamError, StreamResult};
use parking_lot::Mutex;
use tokio::sync::oneshot;

enum State<T> {
    Empty,
    Buffered(T),
    Waiting(oneshot::Sender<T>),
    Resolved,
}

/// A value delivered at most once.
pub struct Waiter<T> {
    state: Mutex<State<T>>,
}

impl<T> Default for Waiter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Waiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            State::Empty => "empty",
            State::Buffered(_) => "buffered",
            State::Waiting(_) => "waiting",
            State::Resolved => "resolved",
        };
        f.debug_struct("Waiter").field("state", &state).finish()
    }
}

impl<T> Waiter<T> {
    /// An unresolved waiter.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Empty),
        }
    }

    /// Deliver `value`. Returns `false` (and drops `value`) if this waiter
    /// already holds or delivered a value.
    pub fn resolve(&self, value: T) -> bool {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Resolved) {
            State::Empty => {
                *state = State::Buffered(value);
                true
            }
            State::Waiting(tx) => {
                // A dropped receiver means the waiting future was abandoned;
                // the value is still considered delivered.
                let _ = tx.send(value);
                true
            }
            previous @ (State::Buffered(_) | State::Resolved) => {
                *state = previous;
                false
            }
        }
    }

    /// Whether a value has been supplied.
    pub fn is_resolved(&self) -> bool {
        matches!(
            &*self.state.lock(),
            State::Buffered(_) | State::Resolved
        )
    }

    /// Wait for the value.
    ///
    /// Returns `None` if the value was already taken by an earlier `wait`,
    /// if another task is already waiting, or if the waiter was dropped
    /// while parked.
    pub async fn wait(&self) -> Option<T> {
        let rx = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Resolved) {
                State::Buffered(value) => return Some(value),
                State::Empty => {
                    let (tx, rx) = oneshot::channel();
                    *state = State::Waiting(tx);
                    rx
                }
                waiting @ State::Waiting(_) => {
                    *state = waiting;
                    return None;
                }
                State::Resolved => return None,
            }
        };
        rx.await.ok()
    }
}

/// Run `write` to completion on its own task and race it against a timer.
///
/// The first of the two to finish resolves a shared [`Waiter`]; the loser
/// is ignored. The write is never cancelled: a hung write keeps running in
/// the background while the caller gets [`StreamError::SendTimeout`].
pub async fn race_with_timeout<F>(write: F, timeout: Duration) -> StreamResult<()>
where
    F: std::future::Future<Output = StreamResult<()>> + Send + 'static,
{
    let outcome = std::sync::Arc::new(Waiter::new());

    let writer = {
        let outcome = outcome.clone();
        tokio::spawn(async move {
            let _ = outcome.resolve(write.await);
        })
    };
    let timer = {
        let outcome = outcome.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = outcome.resolve(Err(StreamError::SendTimeout(timeout)));
        })
    };

    let result = outcome
        .wait()
        .await
        .unwrap_or(Err(StreamError::SendTimeout(timeout)));
    timer.abort();
    drop(writer);
    result
}
