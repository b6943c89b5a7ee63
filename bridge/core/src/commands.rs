//! Command Processor - administrative queries over live state
//!
//! Commands are single lines, as typed at the daemon console:
//!
//! | Line | Effect |
//! |------|--------|
//! | `status` | Session count and ceiling, first client ids, resource totals |
//! | `list` | Every session and every resource |
//! | `cleanup` | Runs a resource sweep |
//! | `say <text>` | Performs `text` on every ready session |
//! | `interrupt` | Broadcasts `chat.interrupt` |
//! | `help` | Lists the commands |
//!
//! Everything except `say`, `interrupt` and `cleanup` is read-only.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::BackendReply;
use crate::manager::{BroadcastResult, ClientId, SessionManager, SessionSummary};
use crate::protocol::{Op, Packet, Payload};
use crate::resource::{ResourceSummary, SweepReport};
use crate::session::{perform, Priority, SessionContext};

/// Client ids shown by `status`
const STATUS_PREVIEW: usize = 3;

/// Motion requested by `say`
pub const SAY_MOTION: &str = "Idle";

/// A parsed console command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Summary counts
    Status,
    /// Sessions and resources
    List,
    /// Run a sweep
    Cleanup,
    /// Perform text on every ready session
    Say(String),
    /// Cut off playback everywhere
    Interrupt,
    /// Command list
    Help,
}

/// Console line that is not a command
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Blank line
    #[error("empty command")]
    Empty,
    /// Unrecognized verb
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),
    /// Verb needs an argument
    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),
}

impl Command {
    /// Parse one console line
    ///
    /// # Errors
    ///
    /// [`CommandError`] for blank lines, unknown verbs, and `say` without text.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(verb, rest)| (verb, rest.trim()));

        match verb.to_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            "status" => Ok(Self::Status),
            "list" | "ls" => Ok(Self::List),
            "cleanup" | "sweep" => Ok(Self::Cleanup),
            "interrupt" => Ok(Self::Interrupt),
            "help" | "?" => Ok(Self::Help),
            "say" if rest.is_empty() => Err(CommandError::MissingArgument("say")),
            "say" => Ok(Self::Say(rest.to_string())),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Result of running a command
#[derive(Debug)]
pub enum CommandOutput {
    /// `status`
    Status {
        /// Live sessions
        sessions: usize,
        /// Ceiling
        max_sessions: usize,
        /// First few client ids in accept order
        preview: Vec<ClientId>,
        /// Live resources
        resources: usize,
        /// Bytes across resources
        resource_bytes: u64,
    },
    /// `list`
    List {
        /// Sessions in accept order
        sessions: Vec<SessionSummary>,
        /// Resources in registration order
        resources: Vec<ResourceSummary>,
    },
    /// `cleanup`
    Cleanup(SweepReport),
    /// `say`
    Said {
        /// Sessions that queued the performance
        delivered: usize,
        /// Sessions that refused it
        failed: usize,
    },
    /// `interrupt`
    Interrupted(BroadcastResult),
    /// `help`
    Help,
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status {
                sessions,
                max_sessions,
                preview,
                resources,
                resource_bytes,
            } => {
                write!(f, "sessions: {sessions}/{max_sessions}")?;
                if !preview.is_empty() {
                    let ids: Vec<&str> = preview.iter().map(ClientId::as_str).collect();
                    write!(f, " [{}", ids.join(", "))?;
                    if *sessions > preview.len() {
                        write!(f, ", ...")?;
                    }
                    write!(f, "]")?;
                }
                write!(f, "\nresources: {resources} ({resource_bytes} bytes)")
            }
            Self::List {
                sessions,
                resources,
            } => {
                writeln!(f, "sessions ({}):", sessions.len())?;
                for s in sessions {
                    writeln!(
                        f,
                        "  {} {} model={} peer={} up={}s",
                        s.id,
                        s.state,
                        s.model.as_deref().unwrap_or("-"),
                        s.peer,
                        s.uptime_secs
                    )?;
                }
                write!(f, "resources ({}):", resources.len())?;
                for r in resources {
                    write!(
                        f,
                        "\n  {} {} {} {}B refs={} {} age={}s",
                        r.rid, r.kind, r.mime, r.size, r.refs, r.location, r.age_secs
                    )?;
                }
                Ok(())
            }
            Self::Cleanup(report) => write!(
                f,
                "purged {} resources ({} bytes)",
                report.removed, report.reclaimed_bytes
            ),
            Self::Said { delivered, failed } => {
                write!(f, "performed on {delivered} session(s)")?;
                if *failed > 0 {
                    write!(f, ", {failed} refused")?;
                }
                Ok(())
            }
            Self::Interrupted(result) => {
                write!(f, "interrupted {} session(s)", result.successful)?;
                if !result.all_succeeded() {
                    write!(f, ", {} refused", result.failed)?;
                }
                Ok(())
            }
            Self::Help => f.write_str("commands: status, list, cleanup, say <text>, interrupt, help"),
        }
    }
}

/// Runs [`Command`]s against the session and resource managers
#[derive(Clone, Debug)]
pub struct CommandProcessor {
    manager: SessionManager,
    ctx: Arc<SessionContext>,
}

impl CommandProcessor {
    /// Create a processor
    #[must_use]
    pub fn new(manager: SessionManager, ctx: Arc<SessionContext>) -> Self {
        Self { manager, ctx }
    }

    /// Parse and run one console line
    ///
    /// # Errors
    ///
    /// [`CommandError`] if the line does not parse.
    pub async fn run_line(&self, line: &str) -> Result<CommandOutput, CommandError> {
        let command = Command::parse(line)?;
        Ok(self.execute(command).await)
    }

    /// Run a parsed command
    pub async fn execute(&self, command: Command) -> CommandOutput {
        tracing::debug!(command = ?command, "Running command");
        match command {
            Command::Status => {
                let stats = self.ctx.resources.stats();
                CommandOutput::Status {
                    sessions: self.manager.count(),
                    max_sessions: self.manager.config().max_sessions,
                    preview: self
                        .manager
                        .client_ids()
                        .into_iter()
                        .take(STATUS_PREVIEW)
                        .collect(),
                    resources: stats.entries,
                    resource_bytes: stats.total_bytes,
                }
            }
            Command::List => CommandOutput::List {
                sessions: self.manager.summaries(),
                resources: self.ctx.resources.list(),
            },
            Command::Cleanup => {
                let report = self.ctx.resources.sweep().await;
                CommandOutput::Cleanup(report)
            }
            Command::Say(text) => self.say(&text).await,
            Command::Interrupt => {
                let packet = Packet::server(Op::ChatInterrupt).with_payload(Payload::new());
                let result = self.manager.broadcast(&packet, Priority::Essential);
                tracing::info!(sessions = result.successful, "Broadcast interrupt");
                CommandOutput::Interrupted(result)
            }
            Command::Help => CommandOutput::Help,
        }
    }

    async fn say(&self, text: &str) -> CommandOutput {
        let reply = BackendReply::text(text)
            .with_motion(SAY_MOTION)
            .with_interrupt(true);
        let mut delivered = 0;
        let mut failed = 0;

        for handle in self.manager.handles() {
            if !handle.state().is_ready() {
                continue;
            }
            match perform(&handle, &self.ctx, &reply).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    tracing::debug!(client_id = %handle.id(), error = %e, "Say not delivered");
                    failed += 1;
                }
            }
        }
        tracing::info!(delivered, failed, "Console say");
        CommandOutput::Said { delivered, failed }
    }
}
