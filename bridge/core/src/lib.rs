//! Bridge Core - session engine between a chat backend and avatar clients
//!
//! This crate accepts avatar clients over persistent connections, speaks a
//! fixed JSON packet protocol with them, and turns backend chat replies into
//! timed performance sequences (expressions, motions, voice, text) that a
//! Live2D-style renderer plays back. It has no dependency on any renderer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Avatar Clients                            │
//! │      ┌───────────┐   ┌───────────┐   ┌─────────────────────┐     │
//! │      │  Browser  │   │  Desktop  │   │  In-process (tests) │     │
//! │      └─────┬─────┘   └─────┬─────┘   └──────────┬──────────┘     │
//! │            └───────────────┴────────────────────┘                │
//! │                            │ JSON packets                        │
//! └────────────────────────────┼─────────────────────────────────────┘
//!                              │ transport
//! ┌────────────────────────────┼─────────────────────────────────────┐
//! │                       BRIDGE CORE                                │
//! │  ┌─────────────────────────┴──────────────────────────────────┐  │
//! │  │   SessionManager ──► Session (state machine, keep-alive)   │  │
//! │  └───────┬──────────────────────────────────────────┬─────────┘  │
//! │          │ InputConverter                OutputConverter ▲       │
//! │          ▼                                               │       │
//! │  ┌──────────────┐        ┌──────────────────┐    ┌───────┴────┐  │
//! │  │ ChatBackend  │        │ ResourceManager  │    │  Emotion   │  │
//! │  │ (echo/ollama)│        │ (rid, refcounts) │    │  tagger    │  │
//! │  └──────────────┘        └──────────────────┘    └────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use bridge_core::{Bridge, BridgeConfig, WsListener};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = BridgeConfig::default();
//!     config.auth.token = Some("abc123".into());
//!     config.validate()?;
//!
//!     let bridge = Bridge::from_config(&config)?;
//!     let _sweeper = bridge.spawn_sweeper();
//!     let mut listener = WsListener::bind(&config.listen_addr(), &config.server.path).await?;
//!     bridge.serve(&mut listener, async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`protocol`]: Packet struct, op vocabulary, JSON codec
//! - [`session`]: Per-connection state machine, auth, keep-alive, outbound queue
//! - [`manager`]: Registry of live sessions, capacity, broadcast
//! - [`convert`]: Inbound normalization and outbound performance planning
//! - [`resource`]: Reference-counted media store with rids and sweeps
//! - [`commands`]: Console commands over live state
//! - [`backend`]: Chat backend interface and adapters
//! - [`transport`]: Transport interface, in-process and WebSocket adapters
//! - [`config`]: Configuration with TOML, environment and CLI layering
//! - [`error`]: Error taxonomy and wire error codes
//! - [`bridge`]: The [`Bridge`] facade for one process

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod convert;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod resource;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use backend::{
    build_backend, BackendConfig, BackendKind, BackendReply, ChatBackend, EchoBackend,
    MediaSource, OllamaBackend, VoiceClip,
};
pub use bridge::{Bridge, DeliveryError};
pub use commands::{Command, CommandError, CommandOutput, CommandProcessor};
pub use error::{BridgeError, ErrorCode};
pub use manager::{
    BroadcastResult, ClientId, ManagerConfig, SessionHandle, SessionManager, SessionSummary,
};
pub use protocol::{Op, Packet, Payload};
pub use session::{
    AuthToken, CloseReason, Priority, Session, SessionConfig, SessionContext, SessionOutcome,
    SessionState,
};

// Conversion exports
pub use convert::{
    Cue, CueKind, EmotionPolicy, InputConverter, KeywordEmotionPolicy, NormalizedChatEvent,
    OutputConfig, OutputConverter, PerformanceSequence,
};

// Resource exports
pub use resource::{
    ResourceConfig, ResourceDescriptor, ResourceError, ResourceKind, ResourceManager,
    ResourceSource, ResourceStatus, Rid, SweepReport, UploadTarget,
};

// Transport exports
pub use transport::{channel_pair, BridgeTransport, InProcessClient, TransportError, TransportListener};
#[cfg(feature = "websocket")]
pub use transport::{WsListener, WsTransport};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, BridgeConfig, ConfigError,
    ConfigOverrides, ConfigSource,
};
