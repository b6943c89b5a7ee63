//! WebSocket Transport
//!
//! Accepts clients over TCP and upgrades them to WebSocket on a single
//! configured path. Requests for any other path are answered with HTTP 404
//! and never reach the session layer.
//!
//! Frames are sent as text when they are valid UTF-8 (always the case for
//! encoded packets) and as binary otherwise. Incoming text and binary frames
//! are both accepted; control frames are handled by tungstenite.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use super::traits::{
    BridgeTransport, FrameReceiver, FrameSender, TransportError, TransportListener,
};

/// Time allowed for the HTTP upgrade
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upgraded connections waiting for `accept`
const ACCEPT_BACKLOG: usize = 16;

/// WebSocket listener bound to one address and path
pub struct WsListener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<WsTransport>,
    acceptor: JoinHandle<()>,
}

impl WsListener {
    /// Bind `addr` and start upgrading connections on `path`
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IoError` if the address cannot be bound.
    pub async fn bind(addr: &str, path: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        let acceptor = tokio::spawn(accept_loop(listener, Arc::from(path), tx));

        tracing::info!(addr = %local_addr, path = %path, "WebSocket listener bound");

        Ok(Self {
            local_addr,
            incoming,
            acceptor,
        })
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

#[async_trait]
impl TransportListener for WsListener {
    async fn accept(&mut self) -> Result<Box<dyn BridgeTransport>, TransportError> {
        self.incoming
            .recv()
            .await
            .map(|t| Box::new(t) as Box<dyn BridgeTransport>)
            .ok_or(TransportError::ConnectionClosed)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

async fn accept_loop(listener: TcpListener, path: Arc<str>, tx: mpsc::Sender<WsTransport>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept failed");
                tokio::task::yield_now().await;
                continue;
            }
        };

        if tx.is_closed() {
            break;
        }

        let tx = tx.clone();
        let path = Arc::clone(&path);
        tokio::spawn(async move {
            match tokio::time::timeout(UPGRADE_TIMEOUT, upgrade(stream, &path)).await {
                Ok(Ok(ws)) => {
                    let _ = tx.send(WsTransport { peer, ws }).await;
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer, error = %e, "WebSocket upgrade rejected");
                }
                Err(_) => {
                    tracing::debug!(peer = %peer, "WebSocket upgrade timed out");
                }
            }
        });
    }
}

async fn upgrade(
    stream: TcpStream,
    path: &str,
) -> Result<WebSocketStream<TcpStream>, TransportError> {
    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() == path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))
}

/// One upgraded WebSocket connection
pub struct WsTransport {
    peer: SocketAddr,
    ws: WebSocketStream<TcpStream>,
}

impl BridgeTransport for WsTransport {
    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        let (sink, stream) = self.ws.split();
        (
            Box::new(WsSender { sink, closed: false }),
            Box::new(WsReceiver { stream }),
        )
    }
}

struct WsSender {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSender for WsSender {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let message = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.sink.send(message).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(e) => match map_ws_error(e) {
                TransportError::ConnectionClosed => Ok(()),
                other => Err(other),
            },
        }
    }
}

struct WsReceiver {
    stream: SplitStream<WebSocketStream<TcpStream>>,
}

#[async_trait]
impl FrameReceiver for WsReceiver {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => {
                    return match map_ws_error(e) {
                        TransportError::ConnectionClosed => Ok(None),
                        other => Err(other),
                    }
                }
            }
        }
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ConnectionClosed
        }
        tungstenite::Error::Io(e) => TransportError::IoError(e),
        other => TransportError::ReceiveFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn test_upgrade_on_configured_path() {
        let mut listener = WsListener::bind("127.0.0.1:0", "/bridge").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let (mut ws, _) = connect_async(format!("ws://{addr}/bridge")).await.unwrap();
            ws.send(Message::Text("{\"op\":\"sys.ping\"}".into()))
                .await
                .unwrap();
            ws.next().await
        });

        let transport = listener.accept().await.unwrap();
        let (mut sender, mut receiver) = transport.split();
        let frame = receiver.recv().await.unwrap().unwrap();
        assert_eq!(frame, b"{\"op\":\"sys.ping\"}");

        sender.send(b"{\"op\":\"sys.pong\"}".to_vec()).await.unwrap();
        let echoed = client.await.unwrap().unwrap().unwrap();
        assert_eq!(echoed, Message::Text("{\"op\":\"sys.pong\"}".into()));
    }

    #[tokio::test]
    async fn test_wrong_path_is_rejected() {
        let listener = WsListener::bind("127.0.0.1:0", "/bridge").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let result = connect_async(format!("ws://{addr}/elsewhere")).await;
        match result {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND);
            }
            other => panic!("expected HTTP rejection, got {:?}", other.map(|_| ())),
        }
    }
}
