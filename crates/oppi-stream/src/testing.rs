//! In-process [`Connector`] for driving the engine without a network.
//!
//! [`MemoryConnector`] plays the server half: it greets every new socket
//! with `stream_connected`, records what the client writes, answers pings,
//! and can be told to fail opens, stall writes, drop the connection, or
//! auto-reply to commands through a responder closure.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use oppi_core::errors::{StreamError, StreamResult};
use oppi_core::protocol::frame_types;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::socket::{Connector, Socket, SocketSink, WireMessage};

/// Builds zero or more reply frames for one outbound command.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

struct MemoryState {
    fail_opens: u32,
    stall_writes: bool,
    auto_pong: bool,
    greet: bool,
    current: Option<(u64, mpsc::UnboundedSender<StreamResult<WireMessage>>)>,
    outbound: VecDeque<Value>,
    responder: Option<Responder>,
}

struct Inner {
    state: Mutex<MemoryState>,
    outbound_ready: Notify,
    connects: AtomicU32,
    pings: AtomicUsize,
    next_id: AtomicU32,
}

/// Server half of an in-memory socket pair.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// A connector that accepts every open and greets with `stream_connected`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MemoryState {
                    fail_opens: 0,
                    stall_writes: false,
                    auto_pong: true,
                    greet: true,
                    current: None,
                    outbound: VecDeque::new(),
                    responder: None,
                }),
                outbound_ready: Notify::new(),
                connects: AtomicU32::new(0),
                pings: AtomicUsize::new(0),
                next_id: AtomicU32::new(0),
            }),
        }
    }

    /// A connector whose responder acknowledges every `subscribe` and
    /// `unsubscribe` with a successful `command_result`.
    pub fn acking_subscriptions() -> Self {
        let connector = Self::new();
        connector.set_responder(|cmd| {
            match cmd["type"].as_str() {
                Some(kind @ ("subscribe" | "unsubscribe")) => vec![command_result(cmd, kind, true)],
                _ => Vec::new(),
            }
        });
        connector
    }

    /// Fail the next `n` open attempts.
    pub fn fail_next_opens(&self, n: u32) {
        self.inner.state.lock().fail_opens = n;
    }

    /// Make every write hang until cleared.
    pub fn set_stall_writes(&self, stall: bool) {
        self.inner.state.lock().stall_writes = stall;
    }

    /// Stop answering pings.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.state.lock().auto_pong = enabled;
    }

    /// Skip the `stream_connected` greeting on new sockets.
    pub fn set_greeting(&self, enabled: bool) {
        self.inner.state.lock().greet = enabled;
    }

    /// Install a closure that answers outbound commands.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        self.inner.state.lock().responder = Some(Arc::new(responder));
    }

    /// Open attempts so far (including failed ones).
    pub fn connect_count(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Pings written by the client so far.
    pub fn ping_count(&self) -> usize {
        self.inner.pings.load(Ordering::SeqCst)
    }

    /// Whether a socket is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().current.is_some()
    }

    /// Push a frame to the client on the current socket.
    pub fn push(&self, frame: Value) -> bool {
        self.push_text(frame.to_string())
    }

    /// Push raw text (possibly malformed) to the client.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push_message(WireMessage::Text(text.into()))
    }

    fn push_message(&self, message: WireMessage) -> bool {
        let state = self.inner.state.lock();
        match &state.current {
            Some((_, tx)) => tx.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    /// Fail the current socket's read side, as a network drop would.
    pub fn drop_connection(&self) {
        let current = self.inner.state.lock().current.take();
        if let Some((_, tx)) = current {
            let _ = tx.send(Err(StreamError::Transport("connection reset by peer".into())));
        }
    }

    /// Next text frame the client wrote, waiting if none yet.
    pub async fn next_outbound(&self) -> Value {
        loop {
            let notified = self.inner.outbound_ready.notified();
            if let Some(frame) = self.inner.state.lock().outbound.pop_front() {
                return frame;
            }
            notified.await;
        }
    }

    /// Next outbound frame whose `type` is `kind`, discarding others.
    pub async fn next_outbound_of(&self, kind: &str) -> Value {
        loop {
            let frame = self.next_outbound().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    /// Every text frame written so far and not yet taken.
    pub fn drain_outbound(&self) -> Vec<Value> {
        self.inner.state.lock().outbound.drain(..).collect()
    }

    fn record_outbound(&self, socket_id: u64, text: &str) {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let responder = {
            let mut state = self.inner.state.lock();
            state.outbound.push_back(frame.clone());
            state.responder.clone()
        };
        let replies = responder.map(|r| r(&frame)).unwrap_or_default();
        self.inner.outbound_ready.notify_waiters();

        let state = self.inner.state.lock();
        if let Some((id, tx)) = &state.current {
            if *id == socket_id {
                for reply in replies {
                    let _ = tx.send(Ok(WireMessage::Text(reply.to_string())));
                }
            }
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> StreamResult<Socket> {
        let _ = self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let socket_id = u64::from(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        {
            let mut state = self.inner.state.lock();
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(StreamError::Transport("connection refused".into()));
            }
            if state.greet {
                let hello = json!({ "type": frame_types::STREAM_CONNECTED });
                let _ = tx.send(Ok(WireMessage::Text(hello.to_string())));
            }
            state.current = Some((socket_id, tx));
        }
        Ok(Socket {
            sink: Arc::new(MemorySink {
                server: self.clone(),
                socket_id,
            }),
            stream: UnboundedReceiverStream::new(rx).boxed(),
        })
    }
}

struct MemorySink {
    server: MemoryConnector,
    socket_id: u64,
}

#[async_trait]
impl SocketSink for MemorySink {
    async fn send(&self, message: WireMessage) -> StreamResult<()> {
        let (stalled, auto_pong, live) = {
            let state = self.server.inner.state.lock();
            let live = matches!(&state.current, Some((id, _)) if *id == self.socket_id);
            (state.stall_writes, state.auto_pong, live)
        };
        if stalled {
            futures::future::pending::<()>().await;
        }
        if !live {
            return Err(StreamError::Transport("socket closed".into()));
        }
        match message {
            WireMessage::Text(text) => self.server.record_outbound(self.socket_id, &text),
            WireMessage::Ping(data) => {
                let _ = self.server.inner.pings.fetch_add(1, Ordering::SeqCst);
                if auto_pong {
                    let _ = self.server.push_message(WireMessage::Pong(data));
                }
            }
            WireMessage::Pong(_) | WireMessage::Close(_) => {}
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.server.inner.state.lock();
        if matches!(&state.current, Some((id, _)) if *id == self.socket_id) {
            state.current = None;
        }
    }
}

/// A `command_result` frame answering `cmd`.
pub fn command_result(cmd: &Value, command: &str, success: bool) -> Value {
    let mut frame = json!({
        "type": frame_types::COMMAND_RESULT,
        "command": command,
        "requestId": cmd["requestId"],
        "success": success,
    });
    if let Some(session) = cmd.get("sessionId") {
        frame["sessionId"] = session.clone();
    }
    frame
}

/// A `turn_ack` frame for `cmd` at `stage`.
pub fn turn_ack(cmd: &Value, stage: &str) -> Value {
    let mut frame = json!({
        "type": frame_types::TURN_ACK,
        "command": cmd["type"],
        "requestId": cmd["requestId"],
        "turnId": cmd["turnId"],
        "stage": stage,
    });
    if let Some(session) = cmd.get("sessionId") {
        frame["sessionId"] = session.clone();
    }
    frame
}
