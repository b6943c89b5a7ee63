//! Bridge - one process worth of wiring
//!
//! [`Bridge`] owns the session manager and the shared [`SessionContext`]
//! and drives transports through them:
//!
//! ```text
//!   TransportListener ──accept──► Bridge::serve
//!                                    │ spawn per connection
//!                                    ▼
//!                       SessionManager::accept ─► Session::run
//!                                    │
//!            ChatBackend ◄── events ─┴─ performances ──► client
//! ```
//!
//! Hosts that produce replies outside [`ChatBackend::handle_event`] push
//! them with [`Bridge::deliver_reply`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::backend::{build_backend, BackendReply, ChatBackend};
use crate::commands::CommandProcessor;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::manager::{ClientId, SessionManager};
use crate::resource::{ResourceManager, SweepReport};
use crate::session::{
    perform, AuthToken, CloseReason, PushOutcome, QueueError, SessionContext, SessionOutcome,
};
use crate::transport::{BridgeTransport, TransportListener};

/// Extra time allowed past the flush timeout for sessions to finish on shutdown
const SHUTDOWN_MARGIN: Duration = Duration::from_millis(500);

/// Why [`Bridge::deliver_reply`] could not queue a performance
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// No live session with that id
    #[error("no session `{0}`")]
    NoSession(ClientId),
    /// Session has not finished its handshake
    #[error("session `{0}` is not ready")]
    NotReady(ClientId),
    /// Outbound queue refused the packet
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Session manager, resource store, converters and backend for one process
#[derive(Clone, Debug)]
pub struct Bridge {
    manager: SessionManager,
    ctx: Arc<SessionContext>,
}

impl Bridge {
    /// Wire a bridge around `backend`
    ///
    /// When the config carries no resource token, resource URLs are
    /// signed with the auth token.
    #[must_use]
    pub fn new(config: &BridgeConfig, token: AuthToken, backend: Arc<dyn ChatBackend>) -> Self {
        let mut resource_config = config.resource.clone();
        if resource_config.token.is_none() {
            resource_config.token = Some(token.expose().to_string());
        }
        let resources = ResourceManager::new(resource_config);
        let ctx = SessionContext::new(
            config.session.clone(),
            token,
            resources,
            config.output.clone(),
            backend,
        );
        Self {
            manager: SessionManager::new(config.manager_config()),
            ctx: Arc::new(ctx),
        }
    }

    /// Build the configured backend and wire a bridge around it
    ///
    /// # Errors
    ///
    /// Fails if the config has no token, the token is unusable, or the
    /// backend cannot be built.
    pub fn from_config(config: &BridgeConfig) -> anyhow::Result<Self> {
        let secret = config
            .auth
            .token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no auth token configured"))?;
        let token = AuthToken::new(secret)?;
        let backend = build_backend(&config.backend)?;
        tracing::info!(
            backend = backend.name(),
            max_sessions = config.server.max_sessions,
            "Bridge configured"
        );
        Ok(Self::new(config, token, backend))
    }

    /// Session registry
    #[must_use]
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Shared per-session context
    #[must_use]
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Shared resource store
    #[must_use]
    pub fn resources(&self) -> &ResourceManager {
        &self.ctx.resources
    }

    /// Console command processor over this bridge
    #[must_use]
    pub fn commands(&self) -> CommandProcessor {
        CommandProcessor::new(self.manager.clone(), Arc::clone(&self.ctx))
    }

    /// Admit one transport and run its session to completion in the background
    ///
    /// # Errors
    ///
    /// [`BridgeError::CapacityExceeded`] if the manager refused the
    /// connection; the peer has already been told.
    pub async fn accept(
        &self,
        transport: Box<dyn BridgeTransport>,
    ) -> Result<JoinHandle<SessionOutcome>, BridgeError> {
        let session = self.manager.accept(transport, Arc::clone(&self.ctx)).await?;
        Ok(tokio::spawn(session.run()))
    }

    /// Accept connections from `listener` until `shutdown` resolves
    ///
    /// Admission runs on a per-connection task so a slow refusal never
    /// stalls the listener. On shutdown every session is asked to close
    /// and given the flush timeout to finish.
    ///
    /// # Errors
    ///
    /// Returns the listener's error if it stops producing connections.
    pub async fn serve<L, F>(&self, listener: &mut L, shutdown: F) -> Result<(), BridgeError>
    where
        L: TransportListener + ?Sized,
        F: Future<Output = ()>,
    {
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping accept loop");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(transport) => {
                        let peer = transport.peer();
                        let manager = self.manager.clone();
                        let ctx = Arc::clone(&self.ctx);
                        sessions.spawn(
                            async move {
                                match manager.accept(transport, ctx).await {
                                    Ok(session) => Some(session.run().await),
                                    Err(e) => {
                                        tracing::debug!(error = %e, "Connection not admitted");
                                        None
                                    }
                                }
                            }
                            .instrument(tracing::debug_span!("connection", %peer)),
                        );
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Listener failed");
                        break Err(BridgeError::Transport(e));
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "Session task ended abnormally");
                    }
                }
            }
        };

        let closing = self.shutdown();
        let bound = self.ctx.config.flush_timeout + SHUTDOWN_MARGIN;
        let drained = tokio::time::timeout(bound, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = sessions.len(), "Aborting sessions that did not close");
            sessions.abort_all();
        }
        tracing::info!(sessions = closing, "Accept loop stopped");
        result
    }

    /// Perform `reply` on one session
    ///
    /// # Errors
    ///
    /// [`DeliveryError`] if the session is gone, not yet ready, or closing.
    pub async fn deliver_reply(
        &self,
        client_id: &ClientId,
        reply: &BackendReply,
    ) -> Result<PushOutcome, DeliveryError> {
        let handle = self
            .manager
            .lookup(client_id)
            .ok_or_else(|| DeliveryError::NoSession(client_id.clone()))?;
        if !handle.state().is_ready() {
            return Err(DeliveryError::NotReady(client_id.clone()));
        }
        Ok(perform(&handle, &self.ctx, reply).await?)
    }

    /// Run one resource sweep
    pub async fn sweep(&self) -> SweepReport {
        self.ctx.resources.sweep().await
    }

    /// Sweep the resource store every cleanup interval until aborted
    #[must_use]
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let resources = self.ctx.resources.clone();
        let period = resources.config().effective_cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = resources.sweep().await;
                if report.removed > 0 {
                    tracing::info!(
                        removed = report.removed,
                        reclaimed_bytes = report.reclaimed_bytes,
                        "Periodic sweep"
                    );
                }
            }
        })
    }

    /// Ask every live session to close; returns how many were signalled
    pub fn shutdown(&self) -> usize {
        self.manager.close_all(CloseReason::Shutdown)
    }
}
