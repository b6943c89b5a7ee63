//! Session protocol state machine
//!
//! ```text
//! Connecting -> Authenticating -> Handshaking -> Ready -> Closing -> Closed
//!      \______________\_______________\___________\________\
//!                                                    -> Failed (sink)
//! ```
//!
//! Each state carries a whitelist of client ops it accepts.

use std::fmt;

use thiserror::Error;

use crate::protocol::Op;

/// Protocol state of one session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Transport accepted, nothing exchanged yet
    #[default]
    Connecting,
    /// Waiting for the credential packet
    Authenticating,
    /// Authenticated, waiting for capabilities
    Handshaking,
    /// Steady state
    Ready,
    /// Draining the outbound queue
    Closing,
    /// Closed cleanly
    Closed,
    /// Terminated by a protocol violation, auth failure, or timeout
    Failed,
}

impl SessionState {
    /// Lowercase name for logs and status payloads
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// `Closed` or `Failed`
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether the session is in steady state
    #[must_use]
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    /// Whether the session has not yet reached `Ready`
    #[must_use]
    pub fn is_pre_ready(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::Handshaking
        )
    }

    /// Whether the client has proven its credential
    #[must_use]
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Handshaking | Self::Ready | Self::Closing)
    }

    /// Whether a client-sent `op` is accepted in this state
    #[must_use]
    pub fn permits(self, op: Op) -> bool {
        match self {
            Self::Authenticating => matches!(op, Op::Auth | Op::Handshake),
            Self::Handshaking => matches!(op, Op::Handshake | Op::Ping | Op::Pong | Op::Close),
            Self::Ready => matches!(
                op,
                Op::Ping
                    | Op::Pong
                    | Op::Close
                    | Op::ChatInput
                    | Op::ChatTouch
                    | Op::ChatShortcut
                    | Op::ResRegister
                    | Op::ResGet
                    | Op::ResRelease
                    | Op::ResAck
                    | Op::ResPrepare
                    | Op::ResCommit
                    | Op::ResProgress
                    | Op::StatusQuery
                    | Op::StatusReport
            ),
            Self::Connecting | Self::Closing | Self::Closed | Self::Failed => false,
        }
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Connecting, Self::Authenticating)
            | (Self::Authenticating, Self::Handshaking)
            | (Self::Handshaking, Self::Ready)
            | (Self::Closing, Self::Closed) => true,
            (
                Self::Connecting | Self::Authenticating | Self::Handshaking | Self::Ready,
                Self::Closing,
            ) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempted transition that the state machine does not allow
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State before the attempt
    pub from: SessionState,
    /// Requested state
    pub to: SessionState,
}

/// Owner of a session's current state
#[derive(Debug)]
pub struct StateMachine {
    state: SessionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in `Connecting`
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, returning the previous state
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves the state unchanged when the
    /// transition is not allowed.
    pub fn transition(&mut self, next: SessionState) -> Result<SessionState, InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// Move to `Failed` unless already terminal
    ///
    /// Returns `true` if the state changed.
    pub fn fail(&mut self) -> bool {
        self.transition(SessionState::Failed).is_ok()
    }
}
