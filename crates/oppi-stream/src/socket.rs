//! Socket seam between the transport and the network.
//!
//! The transport never touches a WebSocket type directly. A [`Connector`]
//! opens a [`Socket`]: a shared write half plus a boxed read stream of
//! [`WireMessage`]s. [`WsConnector`] is the production implementation over
//! `tokio-tungstenite`; [`crate::testing::MemoryConnector`] is the in-process
//! one used by tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, SplitSink};
use futures::{SinkExt, StreamExt};
use oppi_api::CredentialProvider;
use oppi_core::errors::{StreamError, StreamResult};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

/// One message on the socket, independent of the WebSocket library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// A text frame carrying one JSON document.
    Text(String),
    /// Protocol-level ping.
    Ping(Vec<u8>),
    /// Protocol-level pong.
    Pong(Vec<u8>),
    /// Close handshake, with the peer's reason if any.
    Close(Option<String>),
}

/// Write half of an open socket.
#[async_trait]
pub trait SocketSink: Send + Sync {
    /// Write one message. May hang; callers race it against a timer.
    async fn send(&self, message: WireMessage) -> StreamResult<()>;
    /// Start the close handshake. Best-effort.
    async fn close(&self);
}

/// Read half of an open socket.
pub type SocketStream = BoxStream<'static, StreamResult<WireMessage>>;

/// An open socket.
pub struct Socket {
    /// Shared write half.
    pub sink: Arc<dyn SocketSink>,
    /// Inbound messages; ends when the peer goes away.
    pub stream: SocketStream,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").finish_non_exhaustive()
    }
}

/// Opens sockets on demand: once on connect and again on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new socket to the multiplexed endpoint.
    async fn connect(&self) -> StreamResult<Socket>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `tokio-tungstenite` connector with bearer auth.
///
/// Credentials are resolved on every attempt so a rotated token or a
/// switched origin takes effect on the next reconnect.
pub struct WsConnector {
    credentials: Arc<dyn CredentialProvider>,
    stream_path: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Build a connector for `stream_path` on the provider's origin.
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        stream_path: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            stream_path: stream_path.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> StreamResult<Socket> {
        let creds = self
            .credentials
            .credentials()
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;
        let url = creds.stream_url(&self.stream_path);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::Transport(format!("invalid stream url {url}: {e}")))?;
        let bearer = HeaderValue::from_str(&creds.bearer())
            .map_err(|e| StreamError::Transport(format!("invalid token: {e}")))?;
        let _ = request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!(%url, "opening stream socket");
        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| StreamError::Transport(format!("connect timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| StreamError::Transport(e.to_string()))?;
        info!(%url, "stream socket open");

        let (tx, rx) = ws.split();
        let stream = rx
            .filter_map(|msg| async move {
                match msg {
                    Ok(msg) => from_ws(msg).map(Ok),
                    Err(e) => Some(Err(StreamError::Transport(e.to_string()))),
                }
            })
            .boxed();

        Ok(Socket {
            sink: Arc::new(WsSink {
                inner: Mutex::new(tx),
            }),
            stream,
        })
    }
}

struct WsSink {
    inner: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl SocketSink for WsSink {
    async fn send(&self, message: WireMessage) -> StreamResult<()> {
        let mut tx = self.inner.lock().await;
        tx.send(to_ws(message))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn close(&self) {
        let mut tx = self.inner.lock().await;
        let _ = tx.close().await;
    }
}

fn to_ws(message: WireMessage) -> Message {
    match message {
        WireMessage::Text(text) => Message::Text(text.into()),
        WireMessage::Ping(data) => Message::Ping(data.into()),
        WireMessage::Pong(data) => Message::Pong(data.into()),
        WireMessage::Close(_) => Message::Close(None),
    }
}

fn from_ws(message: Message) -> Option<WireMessage> {
    match message {
        Message::Text(text) => Some(WireMessage::Text(text.as_str().to_owned())),
        Message::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok().map(WireMessage::Text),
        Message::Ping(data) => Some(WireMessage::Ping(data.to_vec())),
        Message::Pong(data) => Some(WireMessage::Pong(data.to_vec())),
        Message::Close(frame) => Some(WireMessage::Close(
            frame.map(|f| f.reason.as_str().to_owned()),
        )),
        Message::Frame(_) => None,
    }
}
