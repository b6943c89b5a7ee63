//! Transport Traits
//!
//! A transport carries opaque packet frames between the bridge and one
//! client. Sessions never see sockets; they see a [`FrameSender`] and a
//! [`FrameReceiver`] obtained by splitting a [`BridgeTransport`].

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;

/// Errors that can occur during transport operations
#[derive(Debug)]
pub enum TransportError {
    /// Peer went away or the transport was already closed
    ConnectionClosed,
    /// Failed to send a frame
    SendFailed(String),
    /// Failed to receive a frame
    ReceiveFailed(String),
    /// Upgrade or protocol negotiation failed
    HandshakeFailed(String),
    /// IO error from underlying transport
    IoError(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::ReceiveFailed(msg) => write!(f, "Receive failed: {msg}"),
            Self::HandshakeFailed(msg) => write!(f, "Handshake failed: {msg}"),
            Self::IoError(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

/// Outbound half of a transport
#[async_trait]
pub trait FrameSender: Send {
    /// Deliver one encoded frame
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection; idempotent
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a transport
#[async_trait]
pub trait FrameReceiver: Send {
    /// Next frame, or `Ok(None)` once the peer closed
    ///
    /// Must be cancel-safe: the session loop races it against timers.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// One accepted client connection
pub trait BridgeTransport: Send {
    /// Human-readable peer description for logs
    fn peer(&self) -> String;

    /// Split into independently owned halves
    fn split(self: Box<Self>) -> (Box<dyn FrameSender>, Box<dyn FrameReceiver>);
}

/// Source of new connections
#[async_trait]
pub trait TransportListener: Send {
    /// Wait for the next client
    async fn accept(&mut self) -> Result<Box<dyn BridgeTransport>, TransportError>;

    /// Bound address, when the listener is network-backed
    fn local_addr(&self) -> Option<SocketAddr>;
}
