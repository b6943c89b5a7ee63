//! Transport Layer for bridge clients
//!
//! Provides abstraction over the mechanisms that carry packet frames:
//! - `InProcess`: channel pair for embedding and tests
//! - `WebSocket`: TCP listener upgrading on a single path (feature `websocket`)
//!
//! # Design Philosophy
//!
//! Sessions only see frame halves. Framing is one packet per transport
//! message, so the codec never has to find packet boundaries itself.

pub mod in_process;
pub mod traits;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use in_process::{channel_pair, InProcessClient, InProcessTransport};
pub use traits::{BridgeTransport, FrameReceiver, FrameSender, TransportError, TransportListener};

#[cfg(feature = "websocket")]
pub use websocket::{WsListener, WsTransport};
