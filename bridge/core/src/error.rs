//! Bridge error taxonomy
//!
//! [`BridgeError`] is what packet handlers return. Each variant maps to a
//! stable wire [`ErrorCode`] and knows whether it ends the session.

use std::fmt;

use thiserror::Error;

use crate::protocol::DecodeError;
use crate::resource::ResourceError;
use crate::session::SessionState;
use crate::transport::TransportError;

/// Numeric error codes shared with clients
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed packet
    Decode,
    /// Bad credentials
    AuthFailed,
    /// Op not allowed in the current state
    ProtocolViolation,
    /// Payload does not match the op's schema
    InvalidPayload,
    /// Unsupported protocol version
    VersionMismatch,
    /// Attachment kind not recognized
    UnsupportedAttachment,
    /// Unknown resource id
    ResourceNotFound,
    /// Resource past its lifetime
    ResourceExpired,
    /// Resource above the size ceiling
    ResourceTooLarge,
    /// Session ceiling reached
    CapacityExceeded,
    /// Unexpected server failure
    Internal,
}

impl ErrorCode {
    const TABLE: [(ErrorCode, u32); 11] = [
        (Self::Decode, 4000),
        (Self::AuthFailed, 4001),
        (Self::ProtocolViolation, 4002),
        (Self::InvalidPayload, 4003),
        (Self::VersionMismatch, 4004),
        (Self::UnsupportedAttachment, 4005),
        (Self::ResourceNotFound, 4040),
        (Self::ResourceExpired, 4041),
        (Self::ResourceTooLarge, 4130),
        (Self::CapacityExceeded, 4290),
        (Self::Internal, 5000),
    ];

    /// Numeric wire value
    #[must_use]
    pub fn as_u32(self) -> u32 {
        Self::TABLE
            .iter()
            .find(|(code, _)| *code == self)
            .map_or(5000, |(_, value)| *value)
    }

    /// Parse a numeric wire value
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(code, _)| *code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Errors raised while serving a bridge session
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Frame could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Credential did not match
    #[error("authentication failed")]
    AuthFailed,

    /// Op is not permitted in the current state
    #[error("op `{op}` is not permitted in state {state}")]
    ProtocolViolation {
        /// Offending op string
        op: String,
        /// State the session was in
        state: SessionState,
    },

    /// Payload failed schema checks
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Client speaks an unsupported protocol version
    #[error("unsupported protocol version `{0}`")]
    VersionMismatch(String),

    /// Attachment kind is not recognized
    #[error("unsupported attachment kind `{0}`")]
    UnsupportedAttachment(String),

    /// Resource operation failed
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Session ceiling reached
    #[error("session capacity of {max} reached")]
    CapacityExceeded {
        /// Configured ceiling
        max: usize,
    },

    /// Transport failed underneath the session
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Unexpected failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Wire code for this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Decode(_) => ErrorCode::Decode,
            Self::AuthFailed => ErrorCode::AuthFailed,
            Self::ProtocolViolation { .. } => ErrorCode::ProtocolViolation,
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::VersionMismatch(_) => ErrorCode::VersionMismatch,
            Self::UnsupportedAttachment(_) => ErrorCode::UnsupportedAttachment,
            Self::Resource(e) => e.code(),
            Self::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Self::Transport(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message sent to the client; internal details are not exposed
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Transport(_) | Self::Internal(_) => "internal error".to_string(),
            Self::Resource(e) if e.code() == ErrorCode::Internal => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether this error ends a session that is in `state`
    ///
    /// Authentication and version failures always end the session. Before
    /// `Ready`, any rejected packet does. In `Ready`, per-packet errors are
    /// recovered.
    #[must_use]
    pub fn is_fatal(&self, state: SessionState) -> bool {
        match self {
            Self::AuthFailed | Self::VersionMismatch(_) | Self::CapacityExceeded { .. } => true,
            Self::Decode(_) | Self::ProtocolViolation { .. } | Self::InvalidPayload(_) => {
                !state.is_ready()
            }
            Self::UnsupportedAttachment(_)
            | Self::Resource(_)
            | Self::Transport(_)
            | Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Rid;

    #[test]
    fn test_code_table_round_trip() {
        for (code, value) in ErrorCode::TABLE {
            assert_eq!(code.as_u32(), value);
            assert_eq!(ErrorCode::from_u32(value), Some(code));
        }
        assert_eq!(ErrorCode::from_u32(1), None);
    }

    #[test]
    fn test_resource_errors_map_to_resource_codes() {
        let err = BridgeError::from(ResourceError::NotFound(Rid::from("res-x-1")));
        assert_eq!(err.code(), ErrorCode::ResourceNotFound);

        let err = BridgeError::from(ResourceError::TooLarge { size: 10, max: 5 });
        assert_eq!(err.code(), ErrorCode::ResourceTooLarge);
    }

    #[test]
    fn test_internal_message_is_opaque() {
        let err = BridgeError::Internal("lock poisoned at foo.rs:12".into());
        assert_eq!(err.client_message(), "internal error");
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_fatality_depends_on_state() {
        let violation = BridgeError::ProtocolViolation {
            op: "sys.auth".into(),
            state: SessionState::Ready,
        };
        assert!(!violation.is_fatal(SessionState::Ready));
        assert!(violation.is_fatal(SessionState::Handshaking));

        assert!(BridgeError::AuthFailed.is_fatal(SessionState::Authenticating));
        assert!(!BridgeError::from(ResourceError::ExpiredReference(Rid::from("r")))
            .is_fatal(SessionState::Ready));
    }
}
