//! In-Process Transport
//!
//! Channel-backed transport for embedding the bridge and for tests. The
//! server side implements [`BridgeTransport`]; the [`InProcessClient`] plays
//! the remote peer.
//!
//! # Usage
//!
//! ```ignore
//! let (transport, mut client) = in_process::channel_pair(64, "test");
//! let session = manager.accept(Box::new(transport), ctx).await?;
//! tokio::spawn(session.run());
//!
//! client.send_packet(&auth).await?;
//! let ack = client.recv_packet().await;
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{self, Packet};

use super::traits::{BridgeTransport, FrameReceiver, FrameSender, TransportError};

/// Server side of an in-process connection
pub struct InProcessTransport {
    peer: String,
    to_client: mpsc::Sender<Vec<u8>>,
    from_client: mpsc::Receiver<Vec<u8>>,
}

/// Client side of an in-process connection
pub struct InProcessClient {
    to_server: Option<mpsc::Sender<Vec<u8>>>,
    from_server: mpsc::Receiver<Vec<u8>>,
}

/// Create a connected transport/client pair
#[must_use]
pub fn channel_pair(capacity: usize, peer: impl Into<String>) -> (InProcessTransport, InProcessClient) {
    let (to_client, from_server) = mpsc::channel(capacity.max(1));
    let (to_server, from_client) = mpsc::channel(capacity.max(1));
    (
        InProcessTransport {
            peer: peer.into(),
            to_client,
            from_client,
        },
        InProcessClient {
            to_server: Some(to_server),
            from_server,
        },
    )
}

impl BridgeTransport for InProcessTransport {
    fn peer(&self) -> String {
        format!("in-process:{}", self.peer)
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>) {
        let this = *self;
        (
            Box::new(InProcessSender {
                tx: Some(this.to_client),
            }),
            Box::new(InProcessReceiver {
                rx: this.from_client,
            }),
        )
    }
}

struct InProcessSender {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl FrameSender for InProcessSender {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct InProcessReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameReceiver for InProcessReceiver {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

impl InProcessClient {
    /// Send a raw frame to the server
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once either side has closed.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let tx = self.to_server.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Encode and send a packet
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        self.send(protocol::encode(packet)).await
    }

    /// Next raw frame, `None` once the server closed
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_server.recv().await
    }

    /// Next decodable packet, skipping frames that fail to decode
    pub async fn recv_packet(&mut self) -> Option<Packet> {
        while let Some(frame) = self.from_server.recv().await {
            match protocol::decode(&frame) {
                Ok(packet) => return Some(packet),
                Err(e) => tracing::warn!(error = %e, "In-process client dropped undecodable frame"),
            }
        }
        None
    }

    /// Drop the client's sending half, as a disconnect would
    pub fn close(&mut self) {
        self.to_server = None;
    }
}
