//! Protocol op vocabulary
//!
//! Op strings map onto a fixed enum; routing matches on the variant instead
//! of dispatching on raw strings.

use std::fmt;

/// Op family prefix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpFamily {
    /// `sys.*`: handshake, keep-alive, errors
    Sys,
    /// `chat.*`: inbound input and outbound performances
    Chat,
    /// `res.*`: resource registration and lookup
    Res,
    /// `status.*`: queries and client state reports
    Status,
}

/// Every op the bridge protocol defines
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// Credential packet
    Auth,
    /// Capability negotiation
    Handshake,
    /// Keep-alive ping
    Ping,
    /// Keep-alive answer
    Pong,
    /// Orderly close request
    Close,
    /// Error-only packet
    Error,
    /// Chat text and media from the client
    ChatInput,
    /// Touch on the avatar
    ChatTouch,
    /// Client shortcut key
    ChatShortcut,
    /// Performance sequence for the client
    ChatPerform,
    /// Stop the current performance
    ChatInterrupt,
    /// Register inline content as a resource
    ResRegister,
    /// Resolve a resource reference
    ResGet,
    /// Drop a resource reference
    ResRelease,
    /// Acknowledge receipt of an outbound reference
    ResAck,
    /// Reserve an id for an out-of-band upload
    ResPrepare,
    /// Finish an upload started with `res.prepare`
    ResCommit,
    /// Upload progress report
    ResProgress,
    /// Query bridge status
    StatusQuery,
    /// Client state report
    StatusReport,
}

const OP_NAMES: [(Op, &str); 20] = [
    (Op::Auth, "sys.auth"),
    (Op::Handshake, "sys.handshake"),
    (Op::Ping, "sys.ping"),
    (Op::Pong, "sys.pong"),
    (Op::Close, "sys.close"),
    (Op::Error, "sys.error"),
    (Op::ChatInput, "chat.input"),
    (Op::ChatTouch, "chat.touch"),
    (Op::ChatShortcut, "chat.shortcut"),
    (Op::ChatPerform, "chat.perform"),
    (Op::ChatInterrupt, "chat.interrupt"),
    (Op::ResRegister, "res.register"),
    (Op::ResGet, "res.get"),
    (Op::ResRelease, "res.release"),
    (Op::ResAck, "res.ack"),
    (Op::ResPrepare, "res.prepare"),
    (Op::ResCommit, "res.commit"),
    (Op::ResProgress, "res.progress"),
    (Op::StatusQuery, "status.query"),
    (Op::StatusReport, "status.report"),
];

impl Op {
    /// Wire name of this op
    #[must_use]
    pub fn as_str(self) -> &'static str {
        OP_NAMES
            .iter()
            .find(|(op, _)| *op == self)
            .map_or("sys.error", |(_, name)| name)
    }

    /// Parse a wire name; unknown names yield `None`
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        OP_NAMES
            .iter()
            .find(|(_, candidate)| *candidate == name)
            .map(|(op, _)| *op)
    }

    /// The family this op belongs to
    #[must_use]
    pub fn family(self) -> OpFamily {
        match self {
            Self::Auth | Self::Handshake | Self::Ping | Self::Pong | Self::Close | Self::Error => {
                OpFamily::Sys
            }
            Self::ChatInput
            | Self::ChatTouch
            | Self::ChatShortcut
            | Self::ChatPerform
            | Self::ChatInterrupt => OpFamily::Chat,
            Self::ResRegister
            | Self::ResGet
            | Self::ResRelease
            | Self::ResAck
            | Self::ResPrepare
            | Self::ResCommit
            | Self::ResProgress => OpFamily::Res,
            Self::StatusQuery | Self::StatusReport => OpFamily::Status,
        }
    }

    /// Ops only the server sends
    #[must_use]
    pub fn is_server_only(self) -> bool {
        matches!(self, Self::Error | Self::ChatPerform | Self::ChatInterrupt)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
