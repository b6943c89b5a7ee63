//! Session - the protocol engine for one connection
//!
//! A [`Session`] owns one transport, its state machine, and its outbound
//! queue. It is created by [`SessionManager::accept`] and driven to
//! completion by [`Session::run`].
//!
//! # Tasks
//!
//! ```text
//!   transport ──recv──► Session::run ──events──► backend worker
//!                          │                        │
//!                          │ replies, errors        │ chat.perform
//!                          ▼                        ▼
//!                      OutboundQueue ◄──────────────┘
//!                          │
//!                          ▼
//!                       writer ──send──► transport
//! ```
//!
//! The run loop handles one inbound packet to completion before reading the
//! next, so session state is never mutated by two packets at once. Backend
//! calls happen on the worker so a slow backend does not stall keep-alive
//! or resource requests.
//!
//! # Closing
//!
//! Every exit goes through the same path: mark the state, stop the worker,
//! close the queue and let the writer drain it within `flush_timeout`,
//! release every resource reference the session holds, and unregister.

mod auth;
mod handshake;
mod keepalive;
mod outbound;
mod refs;
mod state;

pub use auth::{
    constant_time_eq, default_token_path, AuthToken, TokenError, RUNTIME_DIR_NAME,
    TOKEN_FILENAME, TOKEN_SIZE,
};
pub use handshake::{
    ack_payload, ClientCapabilities, HandshakeRequest, ServerAdvert, PROTOCOL_MAJOR,
    SERVER_CAPABILITIES,
};
pub use keepalive::{Keepalive, KeepaliveAction, KeepaliveConfig};
pub use outbound::{Outbound, OutboundQueue, Priority, PushOutcome, QueueError};
pub use refs::SessionRefs;
pub use state::{InvalidTransition, SessionState, StateMachine};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backend::{BackendReply, ChatBackend};
use crate::convert::{
    decode_inline, InputConverter, NormalizedChatEvent, OutputConfig, OutputConverter,
};
use crate::error::{BridgeError, ErrorCode};
use crate::manager::{ClientId, SessionHandle, SessionManager};
use crate::protocol::{self, into_payload, DecodeError, Op, Packet};
use crate::resource::{ResourceKind, ResourceManager, ResourceSource, Rid};
use crate::transport::{FrameReceiver, FrameSender};

/// Events waiting for the backend worker
const EVENT_BACKLOG: usize = 32;

/// Per-session limits and timeouts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline from accept to `Ready`
    pub handshake_timeout: Duration,
    /// Inbound silence in `Ready` before closing
    pub idle_timeout: Duration,
    /// Inbound silence in `Ready` before pinging
    pub ping_interval: Duration,
    /// Bound on draining the outbound queue while closing
    pub flush_timeout: Duration,
    /// Outbound queue length
    pub outbound_capacity: usize,
    /// Post-auth decode errors tolerated before failing
    pub max_decode_errors: u32,
    /// How long an outbound resource reference waits for `res.ack`
    pub ack_timeout: Duration,
    /// Longest accepted chat text, in characters
    pub max_message_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            ping_interval: Duration::from_secs(30),
            flush_timeout: Duration::from_millis(2000),
            outbound_capacity: 64,
            max_decode_errors: 3,
            ack_timeout: Duration::from_secs(60),
            max_message_length: 5000,
        }
    }
}

impl SessionConfig {
    /// Short timeouts for tests
    #[must_use]
    pub fn for_testing() -> Self {
        let keepalive = KeepaliveConfig::for_testing();
        Self {
            handshake_timeout: keepalive.handshake_timeout,
            idle_timeout: keepalive.idle_timeout,
            ping_interval: keepalive.ping_interval,
            flush_timeout: Duration::from_millis(200),
            ack_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }

    /// Keep-alive settings derived from this config
    #[must_use]
    pub fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig::new()
            .with_handshake_timeout(self.handshake_timeout)
            .with_ping_interval(self.ping_interval)
            .with_idle_timeout(self.idle_timeout)
    }
}

/// Everything a session shares with the rest of the process
pub struct SessionContext {
    /// Limits and timeouts
    pub config: SessionConfig,
    /// Shared credential
    pub token: AuthToken,
    /// Shared resource store
    pub resources: ResourceManager,
    /// Inbound conversion
    pub input: InputConverter,
    /// Outbound conversion
    pub output: Arc<OutputConverter>,
    /// Where normalized events go
    pub backend: Arc<dyn ChatBackend>,
    /// Values sent in the handshake ack
    pub advert: ServerAdvert,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .field("advert", &self.advert)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Wire the converters and the handshake advert around `resources`
    #[must_use]
    pub fn new(
        config: SessionConfig,
        token: AuthToken,
        resources: ResourceManager,
        output: OutputConfig,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let resource_config = resources.config();
        let advert = ServerAdvert {
            max_message_length: config.max_message_length,
            max_inline_bytes: resource_config.max_inline_bytes,
            resource_base_url: format!(
                "{}{}",
                resource_config.base_url.trim_end_matches('/'),
                resource_config.path
            ),
            ping_interval_ms: u64::try_from(config.ping_interval.as_millis()).unwrap_or(u64::MAX),
        };
        Self {
            input: InputConverter::new(resources.clone(), config.max_message_length),
            output: Arc::new(OutputConverter::new(output, resources.clone())),
            config,
            token,
            resources,
            backend,
            advert,
        }
    }
}

/// Why a session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent `sys.close`
    ClientClosed,
    /// Transport reached end of stream
    Disconnected,
    /// No inbound traffic within the idle timeout
    Idle,
    /// `Ready` not reached within the handshake timeout
    HandshakeTimeout,
    /// Evicted to admit a newer connection
    Kicked,
    /// Server shutting down
    Shutdown,
    /// Credential rejected
    AuthFailed,
    /// Fatal protocol error
    ProtocolViolation,
    /// Transport failed
    TransportError,
}

impl CloseReason {
    /// Lowercase name sent in `sys.close` and logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Disconnected => "disconnected",
            Self::Idle => "idle",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::Kicked => "kicked",
            Self::Shutdown => "shutdown",
            Self::AuthFailed => "auth_failed",
            Self::ProtocolViolation => "protocol_violation",
            Self::TransportError => "transport_error",
        }
    }

    /// Whether the server initiated the close and should tell the client
    fn notifies_client(self) -> bool {
        matches!(self, Self::Idle | Self::Kicked | Self::Shutdown)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Session that ended
    pub client_id: ClientId,
    /// `Closed` or `Failed`
    pub state: SessionState,
    /// Trigger
    pub reason: CloseReason,
}

enum Flow {
    Continue,
    Close(CloseReason),
    Fail(CloseReason),
}

/// One connection's protocol engine
pub struct Session {
    handle: SessionHandle,
    sender: Option<Box<dyn FrameSender>>,
    receiver: Box<dyn FrameReceiver>,
    manager: SessionManager,
    ctx: Arc<SessionContext>,
    machine: StateMachine,
    keepalive: Keepalive,
    decode_errors: u32,
    events: mpsc::Sender<NormalizedChatEvent>,
    events_rx: Option<mpsc::Receiver<NormalizedChatEvent>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", self.handle.id())
            .field("state", &self.machine.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        handle: SessionHandle,
        sender: Box<dyn FrameSender>,
        receiver: Box<dyn FrameReceiver>,
        manager: SessionManager,
        ctx: Arc<SessionContext>,
    ) -> Self {
        let (events, events_rx) = mpsc::channel(EVENT_BACKLOG);
        let keepalive = Keepalive::new(ctx.config.keepalive(), Instant::now());
        Self {
            handle,
            sender: Some(sender),
            receiver,
            manager,
            ctx,
            machine: StateMachine::new(),
            keepalive,
            decode_errors: 0,
            events,
            events_rx: Some(events_rx),
        }
    }

    /// Client id
    #[must_use]
    pub fn id(&self) -> &ClientId {
        self.handle.id()
    }

    /// Shared handle for routing packets to this session
    #[must_use]
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Drive the session until it closes or fails
    pub async fn run(self) -> SessionOutcome {
        let span = tracing::info_span!("session", client_id = %self.handle.id());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> SessionOutcome {
        let writer = self
            .sender
            .take()
            .map(|sender| tokio::spawn(write_loop(self.handle.clone(), sender).in_current_span()));
        let worker = self.events_rx.take().map(|rx| {
            tokio::spawn(
                backend_loop(self.handle.clone(), Arc::clone(&self.ctx), rx).in_current_span(),
            )
        });

        self.advance(SessionState::Authenticating);
        let flow = self.event_loop().await;
        self.finish(flow, writer, worker).await
    }

    async fn event_loop(&mut self) -> Flow {
        loop {
            let now = Instant::now();
            let state = self.machine.state();

            match self.keepalive.poll(state, now) {
                KeepaliveAction::SendPing => {
                    tracing::debug!("Inbound silence, pinging client");
                    let _ = self
                        .handle
                        .try_send(Packet::server(Op::Ping), Priority::Droppable);
                }
                KeepaliveAction::HandshakeExpired => {
                    tracing::warn!(state = %state, "Handshake timed out");
                    return Flow::Fail(CloseReason::HandshakeTimeout);
                }
                KeepaliveAction::IdleExpired => {
                    tracing::info!("Idle timeout");
                    return Flow::Close(CloseReason::Idle);
                }
                KeepaliveAction::Wait(_) => {}
            }
            self.expire_pins(now);

            let deadline = earliest(
                self.keepalive.next_deadline(state),
                self.handle.refs().lock().next_deadline(),
            );

            let received = tokio::select! {
                () = self.handle.close_notified() => {
                    let reason = self.handle.close_requested().unwrap_or(CloseReason::Shutdown);
                    return Flow::Close(reason);
                }
                received = recv_until(self.receiver.as_mut(), deadline) => received,
            };

            let flow = match received {
                None => Flow::Continue,
                Some(Ok(Some(frame))) => {
                    self.keepalive.record_activity(Instant::now());
                    self.on_frame(&frame).await
                }
                Some(Ok(None)) => {
                    tracing::info!("Client disconnected");
                    Flow::Close(CloseReason::Disconnected)
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Transport receive failed");
                    Flow::Fail(CloseReason::TransportError)
                }
            };
            if !matches!(flow, Flow::Continue) {
                return flow;
            }
        }
    }

    async fn on_frame(&mut self, frame: &[u8]) -> Flow {
        let packet = match protocol::decode(frame) {
            Ok(packet) => packet,
            Err(e) => return self.on_decode_error(frame, e).await,
        };
        tracing::debug!(op = %packet.op, id = %packet.id, "Packet received");

        let state = self.machine.state();
        let result = match packet.known_op() {
            Some(op) if state.permits(op) => self.dispatch(op, &packet).await,
            _ => Err(BridgeError::ProtocolViolation {
                op: packet.op.clone(),
                state,
            }),
        };
        match result {
            Ok(flow) => flow,
            Err(e) => self.reject(&packet.id, &e).await,
        }
    }

    async fn on_decode_error(&mut self, frame: &[u8], error: DecodeError) -> Flow {
        let state = self.machine.state();
        if !state.is_authenticated() {
            // nothing in the frame can be trusted yet
            tracing::warn!(error = %error, "Undecodable frame before authentication");
            return Flow::Fail(CloseReason::ProtocolViolation);
        }

        self.decode_errors += 1;
        let id = protocol::salvage_id(frame).unwrap_or_default();
        let err = BridgeError::Decode(error);
        tracing::warn!(
            error = %err,
            count = self.decode_errors,
            max = self.ctx.config.max_decode_errors,
            "Undecodable frame"
        );
        let _ = self
            .handle
            .send(
                Packet::error_reply(id, err.code(), err.client_message()),
                Priority::Essential,
            )
            .await;

        if self.decode_errors > self.ctx.config.max_decode_errors {
            Flow::Fail(CloseReason::ProtocolViolation)
        } else {
            Flow::Continue
        }
    }

    async fn reject(&mut self, id: &str, error: &BridgeError) -> Flow {
        let state = self.machine.state();
        let fatal = error.is_fatal(state);
        tracing::warn!(
            id = %id,
            code = %error.code(),
            error = %error,
            state = %state,
            fatal,
            "Packet rejected"
        );
        let _ = self
            .handle
            .send(
                Packet::error_reply(id, error.code(), error.client_message()),
                Priority::Essential,
            )
            .await;

        match (fatal, error) {
            (false, _) => Flow::Continue,
            (true, BridgeError::AuthFailed) => Flow::Fail(CloseReason::AuthFailed),
            (true, _) => Flow::Fail(CloseReason::ProtocolViolation),
        }
    }

    async fn dispatch(&mut self, op: Op, packet: &Packet) -> Result<Flow, BridgeError> {
        match op {
            Op::Auth => self.on_auth(packet).await,
            Op::Handshake => self.on_handshake(packet).await,
            Op::Ping => {
                let pong = Packet::new(Op::Pong.as_str(), packet.id.clone());
                self.reply(pong, Priority::Droppable).await
            }
            Op::Pong => Ok(Flow::Continue),
            Op::Close => {
                tracing::info!(reason = packet.str_field("reason").unwrap_or(""), "Client closed");
                Ok(Flow::Close(CloseReason::ClientClosed))
            }
            Op::ChatInput => self.on_chat_input(packet).await,
            Op::ChatTouch => {
                let event = self.ctx.input.convert_touch(self.handle.id(), packet);
                self.emit(event).await
            }
            Op::ChatShortcut => {
                let event = self.ctx.input.convert_shortcut(self.handle.id(), packet);
                self.emit(event).await
            }
            Op::ResRegister => self.on_res_register(packet).await,
            Op::ResGet => {
                let rid = required_rid(packet)?;
                let descriptor = self.ctx.resources.resolve(&rid)?;
                let payload = into_payload(json!({ "resource": descriptor.to_value() }));
                self.reply(Packet::reply(packet, payload), Priority::Essential)
                    .await
            }
            Op::ResRelease => self.on_res_release(packet).await,
            Op::ResPrepare => self.on_res_prepare(packet).await,
            Op::ResCommit => self.on_res_commit(packet).await,
            Op::ResProgress => {
                tracing::debug!(
                    rid = packet.str_field("rid").unwrap_or(""),
                    loaded = packet.field("loaded").and_then(serde_json::Value::as_u64),
                    total = packet.field("total").and_then(serde_json::Value::as_u64),
                    "Upload progress"
                );
                Ok(Flow::Continue)
            }
            Op::ResAck => {
                let rid = required_rid(packet)?;
                let acked = self.handle.refs().lock().ack(&rid);
                if acked {
                    let _ = self.ctx.resources.release(&rid);
                } else {
                    tracing::debug!(rid = %rid, "Ack for a reference that is not pinned");
                }
                Ok(Flow::Continue)
            }
            Op::StatusQuery => {
                let stats = self.ctx.resources.stats();
                let payload = into_payload(json!({
                    "sessions": self.manager.count(),
                    "maxSessions": self.manager.config().max_sessions,
                    "resources": stats.entries,
                    "resourceBytes": stats.total_bytes,
                    "state": self.machine.state().as_str(),
                }));
                self.reply(Packet::reply(packet, payload), Priority::Droppable)
                    .await
            }
            Op::StatusReport => {
                let snapshot = packet.payload.clone().map_or(Value::Null, Value::Object);
                self.handle.set_client_state(snapshot);
                Ok(Flow::Continue)
            }
            Op::Error | Op::ChatPerform | Op::ChatInterrupt => Err(BridgeError::ProtocolViolation {
                op: packet.op.clone(),
                state: self.machine.state(),
            }),
        }
    }

    async fn on_auth(&mut self, packet: &Packet) -> Result<Flow, BridgeError> {
        self.authenticate(packet.str_field("token"))?;
        let payload = into_payload(json!({ "authenticated": true }));
        self.reply(Packet::reply(packet, payload), Priority::Essential)
            .await
    }

    async fn on_handshake(&mut self, packet: &Packet) -> Result<Flow, BridgeError> {
        if self.machine.state() == SessionState::Authenticating {
            self.authenticate(packet.str_field("token"))?;
        }
        let request = HandshakeRequest::parse(packet.payload.as_ref())?;

        tracing::info!(
            model = request.capabilities.model.as_deref().unwrap_or("unknown"),
            version = request.version.as_deref().unwrap_or("unspecified"),
            motions = request.capabilities.motions.len(),
            "Handshake accepted"
        );
        self.handle.set_capabilities(request.capabilities);
        self.advance(SessionState::Ready);

        let payload = ack_payload(self.handle.id().as_str(), &self.ctx.advert);
        self.reply(Packet::reply(packet, payload), Priority::Essential)
            .await
    }

    fn authenticate(&mut self, token: Option<&str>) -> Result<(), BridgeError> {
        match token {
            Some(token) if self.ctx.token.verify(token) => {
                self.advance(SessionState::Handshaking);
                tracing::debug!("Client authenticated");
                Ok(())
            }
            _ => Err(BridgeError::AuthFailed),
        }
    }

    async fn on_chat_input(&mut self, packet: &Packet) -> Result<Flow, BridgeError> {
        let converted = self
            .ctx
            .input
            .convert_chat(self.handle.id(), packet)
            .await?;
        {
            let mut refs = self.handle.refs().lock();
            for rid in converted.registered {
                refs.hold(rid);
            }
        }

        for warning in &converted.event.warnings {
            let notice = Packet::error_reply(
                packet.id.clone(),
                ErrorCode::UnsupportedAttachment,
                warning.to_string(),
            );
            let _ = self.handle.send(notice, Priority::Essential).await;
        }
        self.emit(converted.event).await
    }

    async fn on_res_register(&mut self, packet: &Packet) -> Result<Flow, BridgeError> {
        let kind = required_kind(packet)?;
        let data = packet
            .str_field("data")
            .ok_or_else(|| BridgeError::InvalidPayload("`data` is required".into()))?;
        let (uri_mime, bytes) =
            decode_inline(data).map_err(|w| BridgeError::InvalidPayload(w.to_string()))?;
        let mime = packet.str_field("mime").map(str::to_string).or(uri_mime);

        let rid = self
            .ctx
            .resources
            .register(
                ResourceSource::Bytes(bytes),
                kind,
                mime,
                Some(self.handle.id().clone()),
            )
            .await?;
        self.handle.refs().lock().hold(rid.clone());

        let descriptor = self.ctx.resources.resolve(&rid)?;
        tracing::debug!(rid = %rid, size = descriptor.size, "Client registered resource");
        let payload = into_payload(json!({ "resource": descriptor.to_value() }));
        self.reply(Packet::reply(packet, payload), Priority::Essential)
            .await
    }

    async fn on_res_prepare(&mut self, packet: &Packet) -> Result<Flow, BridgeError> {
        let kind = required_kind(packet)?;
        let size = match packet.field("size") {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| BridgeError::InvalidPayload("`size` must be a byte count".into()))?,
        };
        let mime = packet.str_field("mime").map(str::to_string);
        let sha256 = packet.str_field("sha256").map(str::to_string);

        let target = self
            .ctx
            .resources
            .prepare(kind, mime, size, sha256, Some(self.handle.id().clone()))
            .await?;
        self.handle.refs().lock().hold(target.rid.clone());

        let descriptor = self.ctx.resources.resolve(&target.rid)?;
        let mut upload = json!({ "method": "PUT", "url": target.url });
        if let Some(token) = &self.ctx.resources.config().token {
            upload["headers"] = json!({ "Authorization": format!("Bearer {token}") });
        }
        tracing::debug!(rid = %target.rid, size, "Client prepared upload");
        let payload = into_payload(json!({
            "rid": target.rid.as_str(),
            "upload": upload,
            "resource": descriptor.to_value(),
        }));
        self.reply(Packet::reply(packet, payload), Priority::Essential)
            .await
    }

    async fn on_res_commit(&mut self, packet: &Packet) -> Result<Flow, BridgeError> {
        let rid = required_rid(packet)?;
        let data = packet
            .str_field("data")
            .map(|data| {
                decode_inline(data)
                    .map(|(_, bytes)| bytes)
                    .map_err(|w| BridgeError::InvalidPayload(w.to_string()))
            })
            .transpose()?;

        let descriptor = self.ctx.resources.commit(&rid, data).await?;
        let payload = into_payload(json!({
            "rid": rid.as_str(),
            "status": descriptor.status.as_str(),
            "resource": descriptor.to_value(),
        }));
        self.reply(Packet::reply(packet, payload), Priority::Essential)
            .await
    }

    async fn on_res_release(&mut self, packet: &Packet) -> Result<Flow, BridgeError> {
        let rid = required_rid(packet)?;
        if !self.ctx.resources.contains(&rid) {
            return Err(crate::resource::ResourceError::NotFound(rid).into());
        }
        let held = self.handle.refs().lock().unhold(&rid);
        let released = held && self.ctx.resources.release(&rid).is_ok();
        let payload = into_payload(json!({ "rid": rid.as_str(), "released": released }));
        self.reply(Packet::reply(packet, payload), Priority::Essential)
            .await
    }

    async fn emit(&mut self, event: NormalizedChatEvent) -> Result<Flow, BridgeError> {
        tracing::debug!(
            message_id = %event.message_id,
            attachments = event.attachments.len(),
            "Forwarding event to backend"
        );
        self.events
            .send(event)
            .await
            .map_err(|_| BridgeError::Internal("backend worker stopped".into()))?;
        Ok(Flow::Continue)
    }

    async fn reply(&mut self, packet: Packet, priority: Priority) -> Result<Flow, BridgeError> {
        self.handle
            .send(packet, priority)
            .await
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        Ok(Flow::Continue)
    }

    fn advance(&mut self, next: SessionState) {
        match self.machine.transition(next) {
            Ok(previous) => {
                tracing::debug!(from = %previous, to = %next, "Session state changed");
            }
            Err(e) => tracing::error!(error = %e, "Rejected session transition"),
        }
        self.handle.set_state(self.machine.state());
    }

    fn expire_pins(&self, now: Instant) {
        let expired = self.handle.refs().lock().take_expired(now);
        for rid in expired {
            tracing::debug!(rid = %rid, "Outbound reference not acknowledged in time");
            let _ = self.ctx.resources.release(&rid);
        }
    }

    async fn finish(
        mut self,
        flow: Flow,
        writer: Option<JoinHandle<Box<dyn FrameSender>>>,
        worker: Option<JoinHandle<()>>,
    ) -> SessionOutcome {
        let reason = match flow {
            Flow::Fail(reason) => {
                self.machine.fail();
                self.handle.set_state(self.machine.state());
                reason
            }
            Flow::Close(reason) => {
                self.advance(SessionState::Closing);
                reason
            }
            Flow::Continue => {
                self.advance(SessionState::Closing);
                CloseReason::Disconnected
            }
        };

        if let Some(worker) = worker {
            worker.abort();
        }
        if reason.notifies_client() {
            let notice = Packet::server(Op::Close)
                .with_payload(into_payload(json!({ "reason": reason.as_str() })));
            if let Err(e) = self.handle.queue().close_with(notice) {
                tracing::debug!(error = %e, reason = %reason, "Close notice not queued");
            }
        } else {
            self.handle.queue().close();
        }
        if let Some(mut writer) = writer {
            match tokio::time::timeout(self.ctx.config.flush_timeout, &mut writer).await {
                Ok(Ok(mut sender)) => {
                    if let Err(e) = sender.close().await {
                        tracing::debug!(error = %e, "Transport close failed");
                    }
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "Writer task failed"),
                Err(_) => {
                    tracing::warn!(
                        pending = self.handle.queue().len(),
                        "Outbound flush timed out"
                    );
                    // aborting drops the sender, which ends the transport
                    writer.abort();
                    let _ = writer.await;
                }
            }
        }

        if self.machine.state() == SessionState::Closing {
            self.advance(SessionState::Closed);
        }

        let rids = self.handle.refs().lock().drain();
        let released = self.ctx.resources.release_all(rids.iter());
        self.manager.remove(self.handle.id());

        let state = self.machine.state();
        tracing::info!(
            reason = %reason,
            state = %state,
            released_refs = released,
            "Session ended"
        );
        SessionOutcome {
            client_id: self.handle.id().clone(),
            state,
            reason,
        }
    }
}

/// Convert `reply` for the session behind `handle` and queue it
///
/// Every rid in the resulting sequence is pinned on the session until the
/// client acknowledges it, the ack timeout passes, or the session closes.
///
/// # Errors
///
/// [`QueueError::Closed`] if the session is closing; any references taken
/// for the sequence are given back.
pub async fn perform(
    handle: &SessionHandle,
    ctx: &SessionContext,
    reply: &BackendReply,
) -> Result<PushOutcome, QueueError> {
    let capabilities = handle.capabilities();
    let sequence = ctx
        .output
        .convert(reply, &capabilities, Some(handle.id()))
        .await;
    let rids = sequence.resource_refs();

    {
        let mut refs = handle.refs().lock();
        if handle.queue().is_closed() {
            drop(refs);
            ctx.resources.release_all(rids.iter());
            return Err(QueueError::Closed);
        }
        let deadline = Instant::now() + ctx.config.ack_timeout;
        for rid in &rids {
            refs.pin(rid.clone(), deadline);
        }
    }

    tracing::debug!(
        cues = sequence.cues.len(),
        resources = rids.len(),
        duration_ms = sequence.total_duration(),
        "Sending performance"
    );
    let packet = Packet::server(Op::ChatPerform)
        .with_payload(sequence.to_payload(reply.reply_to.as_deref()));
    handle.send(packet, Priority::Essential).await
}

async fn write_loop(handle: SessionHandle, mut sender: Box<dyn FrameSender>) -> Box<dyn FrameSender> {
    while let Some(outbound) = handle.queue().pop().await {
        let frame = protocol::encode(&outbound.packet);
        if let Err(e) = sender.send(frame).await {
            tracing::warn!(error = %e, op = %outbound.packet.op, "Transport send failed");
            handle.request_close(CloseReason::TransportError);
            break;
        }
    }
    sender
}

async fn backend_loop(
    handle: SessionHandle,
    ctx: Arc<SessionContext>,
    mut events: mpsc::Receiver<NormalizedChatEvent>,
) {
    while let Some(event) = events.recv().await {
        match ctx.backend.handle_event(&event).await {
            Ok(Some(mut reply)) => {
                if reply.reply_to.is_none() {
                    reply.reply_to = Some(event.message_id.clone());
                }
                if let Err(e) = perform(&handle, &ctx, &reply).await {
                    tracing::debug!(error = %e, "Dropping reply for closing session");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    backend = ctx.backend.name(),
                    message_id = %event.message_id,
                    error = %e,
                    "Backend failed to handle event"
                );
                let notice = Packet::error_reply(
                    event.message_id.clone(),
                    ErrorCode::Internal,
                    "internal error",
                );
                let _ = handle.send(notice, Priority::Essential).await;
            }
        }
    }
}

/// Receive one frame, giving up at `deadline`
///
/// `None` means the deadline passed first.
async fn recv_until(
    receiver: &mut dyn FrameReceiver,
    deadline: Option<Instant>,
) -> Option<Result<Option<Vec<u8>>, crate::transport::TransportError>> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at.into(), receiver.recv()).await.ok(),
        None => Some(receiver.recv().await),
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn required_kind(packet: &Packet) -> Result<ResourceKind, BridgeError> {
    let name = packet
        .str_field("kind")
        .ok_or_else(|| BridgeError::InvalidPayload("`kind` is required".into()))?;
    ResourceKind::parse(name).ok_or_else(|| BridgeError::UnsupportedAttachment(name.to_string()))
}

fn required_rid(packet: &Packet) -> Result<Rid, BridgeError> {
    packet
        .str_field("rid")
        .filter(|rid| !rid.is_empty())
        .map(Rid::from)
        .ok_or_else(|| BridgeError::InvalidPayload("`rid` is required".into()))
}
