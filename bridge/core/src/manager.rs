//! Session Manager - live session registry and admission control
//!
//! The `SessionManager` accepts transports, enforces the session ceiling,
//! tracks every live session by client id, and routes packets to one
//! session or broadcasts them to all of them.
//!
//! # Architecture
//!
//! ```text
//!                      SessionManager
//!                     ┌────────────────────────────────────────┐
//!                     │ order: Vec<ClientId>  (insertion order)│
//!                     │ handles: HashMap<ClientId, Handle>     │
//!                     │   - wrapped in Arc<RwLock<>>           │
//!                     └───────────────┬────────────────────────┘
//!                                     │
//!              ┌──────────────────────┼──────────────────────┐
//!              │                      │                      │
//!       ┌──────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!       │   Session   │       │   Session    │       │   Session    │
//!       │ client-3f.. │       │ client-a0..  │       │ client-71..  │
//!       └─────────────┘       └──────────────┘       └──────────────┘
//! ```
//!
//! # Thread Safety
//!
//! Admission and insertion happen under one write lock, so two concurrent
//! accepts can never both take the last slot. The lock is never held across
//! an await point.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{BridgeError, ErrorCode};
use crate::protocol::{self, Packet};
use crate::session::{
    ClientCapabilities, CloseReason, OutboundQueue, Priority, PushOutcome, QueueError, Session,
    SessionContext, SessionRefs, SessionState,
};
use crate::transport::BridgeTransport;

/// Server-issued identifier for one connection
///
/// Fresh for every accepted transport; never reused across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a new unique client id
    #[must_use]
    pub fn new() -> Self {
        Self(format!("client-{}", uuid::Uuid::new_v4().simple()))
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Admission policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Live session ceiling
    pub max_sessions: usize,
    /// Evict the oldest session instead of refusing at the ceiling
    pub kick_old: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1,
            kick_old: false,
        }
    }
}

/// Mutable per-session facts visible outside the session task
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Current protocol state
    pub state: SessionState,
    /// Capabilities reported at handshake
    pub capabilities: ClientCapabilities,
    /// Last `status.report` snapshot
    pub client_state: Option<Value>,
}

struct HandleInner {
    id: ClientId,
    peer: String,
    connected_at: Instant,
    queue: OutboundQueue,
    info: RwLock<SessionInfo>,
    refs: Mutex<SessionRefs>,
    close_reason: Mutex<Option<CloseReason>>,
    close_signal: Notify,
}

/// Shared handle to a live session
///
/// Cloning is cheap. The handle stays usable after the session ends; sends
/// then fail with [`QueueError::Closed`].
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub(crate) fn new(id: ClientId, peer: String, outbound_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                peer,
                connected_at: Instant::now(),
                queue: OutboundQueue::new(outbound_capacity),
                info: RwLock::new(SessionInfo::default()),
                refs: Mutex::new(SessionRefs::new()),
                close_reason: Mutex::new(None),
                close_signal: Notify::new(),
            }),
        }
    }

    /// Client id
    #[must_use]
    pub fn id(&self) -> &ClientId {
        &self.inner.id
    }

    /// Peer description from the transport
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Seconds since accept
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.connected_at.elapsed().as_secs()
    }

    /// Current protocol state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.info.read().state
    }

    /// Snapshot of the session facts
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        self.inner.info.read().clone()
    }

    /// Capabilities reported at handshake
    #[must_use]
    pub fn capabilities(&self) -> ClientCapabilities {
        self.inner.info.read().capabilities.clone()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.inner.info.write().state = state;
    }

    pub(crate) fn set_capabilities(&self, capabilities: ClientCapabilities) {
        self.inner.info.write().capabilities = capabilities;
    }

    pub(crate) fn set_client_state(&self, snapshot: Value) {
        self.inner.info.write().client_state = Some(snapshot);
    }

    pub(crate) fn queue(&self) -> &OutboundQueue {
        &self.inner.queue
    }

    pub(crate) fn refs(&self) -> &Mutex<SessionRefs> {
        &self.inner.refs
    }

    /// Queue a packet, waiting for room if it is essential
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] once the session is closing.
    pub async fn send(&self, packet: Packet, priority: Priority) -> Result<PushOutcome, QueueError> {
        self.inner.queue.push(packet, priority).await
    }

    /// Queue a packet without waiting
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`] when an essential packet finds no room,
    /// [`QueueError::Closed`] once the session is closing.
    pub fn try_send(&self, packet: Packet, priority: Priority) -> Result<PushOutcome, QueueError> {
        self.inner.queue.try_push(packet, priority)
    }

    /// Ask the session task to close; the first reason wins
    pub fn request_close(&self, reason: CloseReason) {
        {
            let mut slot = self.inner.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.close_signal.notify_one();
    }

    /// Reason given to [`request_close`](Self::request_close), if any
    #[must_use]
    pub fn close_requested(&self) -> Option<CloseReason> {
        *self.inner.close_reason.lock()
    }

    pub(crate) async fn close_notified(&self) {
        self.inner.close_signal.notified().await;
    }
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Sessions that queued the packet
    pub successful: usize,
    /// Sessions whose queue refused it
    pub failed: usize,
    /// Ids of the refusing sessions
    pub failed_ids: Vec<ClientId>,
}

impl BroadcastResult {
    /// Check if all recipients queued the packet
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, id: &ClientId, outcome: Result<PushOutcome, QueueError>) {
        match outcome {
            Ok(PushOutcome::Queued | PushOutcome::QueuedAfterEviction) => self.successful += 1,
            Ok(PushOutcome::Discarded) | Err(_) => {
                self.failed += 1;
                self.failed_ids.push(id.clone());
            }
        }
    }
}

/// One row of [`SessionManager::summaries`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Client id
    pub id: ClientId,
    /// Peer description
    pub peer: String,
    /// Protocol state
    pub state: SessionState,
    /// Model reported at handshake
    pub model: Option<String>,
    /// Seconds since accept
    pub uptime_secs: u64,
}

#[derive(Default)]
struct Registry {
    order: Vec<ClientId>,
    handles: HashMap<ClientId, SessionHandle>,
}

impl Registry {
    fn insert(&mut self, handle: SessionHandle) {
        self.order.push(handle.id().clone());
        self.handles.insert(handle.id().clone(), handle);
    }

    fn remove(&mut self, id: &ClientId) -> Option<SessionHandle> {
        let handle = self.handles.remove(id)?;
        self.order.retain(|other| other != id);
        Some(handle)
    }

    fn ordered(&self) -> Vec<SessionHandle> {
        self.order
            .iter()
            .filter_map(|id| self.handles.get(id).cloned())
            .collect()
    }
}

/// Registry of live sessions
///
/// Cloning is cheap; clones share the registry.
#[derive(Clone)]
pub struct SessionManager {
    config: ManagerConfig,
    inner: Arc<RwLock<Registry>>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config())
            .field("sessions", &self.count())
            .finish()
    }
}

impl SessionManager {
    /// Create an empty manager
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(Registry::default())),
        }
    }

    /// Admission policy
    #[must_use]
    pub fn config(&self) -> ManagerConfig {
        self.config
    }

    /// Admit a transport and build its session
    ///
    /// The returned [`Session`] is registered but idle until
    /// [`Session::run`] is driven.
    ///
    /// # Errors
    ///
    /// [`BridgeError::CapacityExceeded`] at the ceiling (without
    /// `kick_old`). The refused peer receives a `sys.error` packet with
    /// code 4290 before its transport is closed.
    pub async fn accept(
        &self,
        transport: Box<dyn BridgeTransport>,
        ctx: Arc<SessionContext>,
    ) -> Result<Session, BridgeError> {
        let peer = transport.peer();
        let (mut sender, receiver) = transport.split();
        let handle = SessionHandle::new(ClientId::new(), peer, ctx.config.outbound_capacity);

        let (admitted, kicked) = {
            let mut registry = self.inner.write();
            let mut kicked = None;
            if registry.handles.len() >= self.config.max_sessions && self.config.kick_old {
                if let Some(oldest) = registry.order.first().cloned() {
                    kicked = registry.remove(&oldest);
                }
            }
            if registry.handles.len() < self.config.max_sessions {
                registry.insert(handle.clone());
                (true, kicked)
            } else {
                (false, kicked)
            }
        };

        if let Some(old) = kicked {
            tracing::info!(client_id = %old.id(), "Evicting oldest session for new connection");
            old.request_close(CloseReason::Kicked);
        }

        if !admitted {
            let max = self.config.max_sessions;
            let err = BridgeError::CapacityExceeded { max };
            tracing::warn!(peer = %handle.peer(), max, "Connection refused at capacity");
            let refusal = Packet::error_reply("", ErrorCode::CapacityExceeded, err.client_message());
            if let Err(e) = sender.send(protocol::encode(&refusal)).await {
                tracing::debug!(error = %e, "Could not deliver capacity refusal");
            }
            let _ = sender.close().await;
            return Err(err);
        }

        tracing::info!(
            client_id = %handle.id(),
            peer = %handle.peer(),
            sessions = self.count(),
            "Session accepted"
        );
        Ok(Session::new(handle, sender, receiver, self.clone(), ctx))
    }

    /// Find a live session
    #[must_use]
    pub fn lookup(&self, id: &ClientId) -> Option<SessionHandle> {
        self.inner.read().handles.get(id).cloned()
    }

    /// Drop a session from the registry; idempotent
    pub fn remove(&self, id: &ClientId) -> Option<SessionHandle> {
        let handle = self.inner.write().remove(id);
        if handle.is_some() {
            tracing::info!(client_id = %id, "Session unregistered");
        }
        handle
    }

    /// Number of live sessions
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().handles.len()
    }

    /// Client ids in accept order
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.inner.read().order.clone()
    }

    /// Handles in accept order
    #[must_use]
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.inner.read().ordered()
    }

    /// Display rows in accept order
    #[must_use]
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.handles()
            .into_iter()
            .map(|handle| {
                let info = handle.info();
                SessionSummary {
                    id: handle.id().clone(),
                    peer: handle.peer().to_string(),
                    state: info.state,
                    model: info.capabilities.model,
                    uptime_secs: handle.uptime_secs(),
                }
            })
            .collect()
    }

    fn ready_handles(&self) -> Vec<SessionHandle> {
        self.handles()
            .into_iter()
            .filter(|h| h.state().is_ready())
            .collect()
    }

    /// Queue `packet` on every ready session without waiting
    #[must_use]
    pub fn broadcast(&self, packet: &Packet, priority: Priority) -> BroadcastResult {
        let mut result = BroadcastResult::default();
        for handle in self.ready_handles() {
            result.record(handle.id(), handle.try_send(packet.clone(), priority));
        }
        result
    }

    /// Queue `packet` on every ready session, waiting for room
    pub async fn broadcast_async(&self, packet: &Packet, priority: Priority) -> BroadcastResult {
        // Handles are collected first so no lock is held across the awaits
        let handles = self.ready_handles();
        let mut result = BroadcastResult::default();
        for handle in handles {
            let outcome = handle.send(packet.clone(), priority).await;
            result.record(handle.id(), outcome);
        }
        result
    }

    /// Queue `packet` on one session
    ///
    /// `None` when the session is unknown; otherwise the queue outcome.
    pub async fn send_to(
        &self,
        id: &ClientId,
        packet: Packet,
        priority: Priority,
    ) -> Option<Result<PushOutcome, QueueError>> {
        let handle = self.lookup(id)?;
        Some(handle.send(packet, priority).await)
    }

    /// Ask every session to close
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let handles = self.handles();
        for handle in &handles {
            handle.request_close(reason);
        }
        handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Op;

    fn handle(id: &str) -> SessionHandle {
        SessionHandle::new(ClientId::from(id), "test".into(), 8)
    }

    fn manager_with(handles: &[SessionHandle]) -> SessionManager {
        let manager = SessionManager::new(ManagerConfig {
            max_sessions: 8,
            kick_old: false,
        });
        for h in handles {
            manager.inner.write().insert(h.clone());
        }
        manager
    }

    #[test]
    fn test_client_id_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("client-"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let a = handle("a");
        let manager = manager_with(&[a.clone()]);

        assert!(manager.remove(a.id()).is_some());
        assert!(manager.remove(a.id()).is_none());
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let manager = manager_with(&[handle("c"), handle("a"), handle("b")]);
        let ids: Vec<String> = manager
            .client_ids()
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        manager.remove(&ClientId::from("a"));
        assert_eq!(manager.client_ids().len(), 2);
        assert_eq!(manager.summaries()[1].id, ClientId::from("b"));
    }

    #[test]
    fn test_broadcast_only_reaches_ready_sessions() {
        let ready = handle("ready");
        ready.set_state(SessionState::Ready);
        let pending = handle("pending");
        pending.set_state(SessionState::Handshaking);
        let manager = manager_with(&[ready.clone(), pending.clone()]);

        let result = manager.broadcast(&Packet::server(Op::ChatInterrupt), Priority::Essential);
        assert_eq!(result.successful, 1);
        assert!(result.all_succeeded());
        assert_eq!(ready.queue().len(), 1);
        assert!(pending.queue().is_empty());
    }

    #[test]
    fn test_broadcast_reports_closed_queue() {
        let ready = handle("ready");
        ready.set_state(SessionState::Ready);
        ready.queue().close();
        let manager = manager_with(&[ready]);

        let result = manager.broadcast(&Packet::server(Op::ChatInterrupt), Priority::Essential);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failed_ids, vec![ClientId::from("ready")]);
    }

    #[test]
    fn test_first_close_reason_wins() {
        let h = handle("x");
        h.request_close(CloseReason::Kicked);
        h.request_close(CloseReason::Shutdown);
        assert_eq!(h.close_requested(), Some(CloseReason::Kicked));
    }

    #[tokio::test]
    async fn test_close_all_signals_every_session() {
        let a = handle("a");
        let b = handle("b");
        let manager = manager_with(&[a.clone(), b.clone()]);

        assert_eq!(manager.close_all(CloseReason::Shutdown), 2);
        // notify_one stores a permit, so this completes without a waiter
        a.close_notified().await;
        assert_eq!(b.close_requested(), Some(CloseReason::Shutdown));
    }
}
