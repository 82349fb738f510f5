//! Physical socket seam.
//!
//! The controller consumes a duplex socket through the [`Connector`] and
//! [`Socket`] traits: connect resolves once the open handshake completes,
//! inbound traffic arrives as [`SocketSignal`]s, and the close signal always
//! carries the clean flag and numeric close code. The production
//! implementation wraps `tokio-tungstenite`.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{InvalidHeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Errors produced by the socket transport.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Sub-protocol identifier could not be used as a header value.
    #[error("invalid subprotocol header: {0}")]
    InvalidSubprotocol(#[from] InvalidHeaderValue),

    /// The socket is no longer writable.
    #[error("socket is closed")]
    Closed,
}

/// Close notification payload: was the shutdown clean, and the close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketClose {
    pub clean: bool,
    pub code: u16,
}

/// Inbound signal from a live socket.
#[derive(Debug)]
pub enum SocketSignal {
    /// A text frame.
    Frame(String),
    /// Transport error; a close signal is expected to follow.
    Error(String),
    /// The socket has shut down. Terminal: the socket must be dropped.
    Closed(SocketClose),
}

/// A live duplex socket.
pub trait Socket: Send {
    /// Writes one text frame.
    fn transmit(&mut self, text: String) -> BoxFuture<'_, Result<(), SocketError>>;

    /// Requests shutdown with a close code and reason. The shutdown is
    /// complete only once `recv` yields [`SocketSignal::Closed`].
    fn shutdown(&mut self, code: u16, reason: String) -> BoxFuture<'_, Result<(), SocketError>>;

    /// Waits for the next inbound signal.
    fn recv(&mut self) -> BoxFuture<'_, SocketSignal>;
}

/// Establishes sockets; resolution of the returned future is the open signal.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        url: &str,
        subprotocol: &str,
    ) -> BoxFuture<'static, Result<Box<dyn Socket>, SocketError>>;
}

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(
        &self,
        url: &str,
        subprotocol: &str,
    ) -> BoxFuture<'static, Result<Box<dyn Socket>, SocketError>> {
        let url = url.to_string();
        let subprotocol = subprotocol.to_string();
        Box::pin(async move {
            let mut request = url.into_client_request()?;
            let protocol: HeaderValue = subprotocol.parse()?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
            let (inner, _response) = connect_async(request).await?;
            Ok(Box::new(WsSocket { inner }) as Box<dyn Socket>)
        })
    }
}

struct WsSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Socket for WsSocket {
    fn transmit(&mut self, text: String) -> BoxFuture<'_, Result<(), SocketError>> {
        Box::pin(async move {
            self.inner
                .send(Message::Text(text))
                .await
                .map_err(SocketError::from)
        })
    }

    fn shutdown(&mut self, code: u16, reason: String) -> BoxFuture<'_, Result<(), SocketError>> {
        Box::pin(async move {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            };
            self.inner.close(Some(frame)).await.map_err(SocketError::from)
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, SocketSignal> {
        Box::pin(async move {
            loop {
                match self.inner.next().await {
                    Some(Ok(Message::Text(text))) => return SocketSignal::Frame(text),
                    Some(Ok(Message::Binary(bytes))) => {
                        return SocketSignal::Frame(String::from_utf8_lossy(&bytes).into_owned());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = self.inner.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                        return SocketSignal::Closed(SocketClose { clean: true, code });
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(err)) => return SocketSignal::Error(err.to_string()),
                    None => return SocketSignal::Closed(SocketClose { clean: false, code: 1006 }),
                }
            }
        })
    }
}
