//! Bridge Daemon - avatar bridge server process
//!
//! Serves avatar clients over WebSocket, hands their input to the configured
//! chat backend, and streams performances back.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (echo backend, port 9090, generated token)
//! bridge-daemon
//!
//! # Fixed token, two sessions, Ollama backend
//! bridge-daemon --token abc123 --max-sessions 2 --backend ollama
//!
//! # With config file
//! bridge-daemon --config /etc/avatar-bridge/bridge.toml
//!
//! # Daemonize (run in background)
//! bridge-daemon --daemonize
//!
//! # Verbose logging
//! RUST_LOG=debug bridge-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown, every session is closed

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bridge_core::session::RUNTIME_DIR_NAME;
use bridge_core::{
    load_config_from_path, AuthToken, BackendKind, BridgeConfig, ConfigOverrides,
};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use server::DaemonServer;

/// Bridge Daemon - serves avatar clients for a chat backend
#[derive(Parser, Debug)]
#[command(name = "bridge-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "BRIDGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long, env = "BRIDGE_HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(short = 'p', long, env = "BRIDGE_PORT")]
    port: Option<u16>,

    /// Shared bearer token (generated when absent)
    #[arg(long, env = "BRIDGE_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Live session ceiling
    #[arg(long, env = "BRIDGE_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Chat backend (echo, ollama)
    #[arg(short = 'b', long, env = "BRIDGE_BACKEND")]
    backend: Option<BackendKind>,

    /// Run as daemon (fork to background)
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// PID file path
    #[arg(long, env = "BRIDGE_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref host) = self.host {
            overrides = overrides.with_host(host.clone());
        }
        if let Some(port) = self.port {
            overrides = overrides.with_port(port);
        }
        if let Some(ref token) = self.token {
            overrides = overrides.with_token(token.clone());
        }
        if let Some(max) = self.max_sessions {
            overrides = overrides.with_max_sessions(max);
        }
        if let Some(backend) = self.backend {
            overrides = overrides.with_backend(backend);
        }
        overrides
    }
}

/// Get the default PID file path
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise /tmp/avatar-bridge-$UID/
fn default_pid_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join(RUNTIME_DIR_NAME).join("bridge.pid")
    } else {
        let uid = nix::unistd::getuid();
        PathBuf::from(format!("/tmp/{RUNTIME_DIR_NAME}-{uid}/bridge.pid"))
    }
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Whether a process with this PID exists
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 only checks existence; EPERM means it exists under another user
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Refuse to start if another daemon owns the PID file; remove it if stale
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    if process_alive(pid) {
        anyhow::bail!(
            "Another bridge-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("bridge_daemon={level},bridge_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Daemonize the process (fork to background)
///
/// Must run before the tokio runtime starts.
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // First fork
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("First fork failed: {e}"),
    }

    setsid().context("setsid failed")?;

    // Second fork (prevent acquiring controlling terminal)
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("Second fork failed: {e}"),
    }

    Ok(())
}

/// Load, override and validate the configuration
fn resolve_config(args: &Args) -> Result<BridgeConfig> {
    let path = args.config.clone().or_else(bridge_core::default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    info!(source = %config.source(), listen = %config.listen_addr(), "Configuration resolved");
    Ok(config)
}

/// Use the configured token, or generate one and publish it to the token file
async fn ensure_token(config: &mut BridgeConfig) -> Result<()> {
    if config.auth.token.is_some() {
        return Ok(());
    }
    let token = AuthToken::generate();
    token
        .write_to_file(&config.auth.token_file)
        .await
        .with_context(|| format!("Failed to write token file {:?}", config.auth.token_file))?;
    info!(path = ?config.auth.token_file, "Generated auth token");
    config.auth.token = Some(token.expose().to_string());
    Ok(())
}

/// Resolve when SIGTERM or SIGINT arrives
async fn shutdown_signal(
    mut sigterm: tokio::signal::unix::Signal,
    mut sigint: tokio::signal::unix::Signal,
) {
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Bridge Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let pid_path = args.pid_file.clone().unwrap_or_else(default_pid_path);
    info!(pid_path = ?pid_path, "PID file path");

    check_existing_daemon(&pid_path)?;
    let config = resolve_config(&args)?;

    // Forking is only sound before the runtime spawns its threads
    if args.daemonize {
        info!("Daemonizing...");
        daemonize()?;
        info!("Daemonized, new PID: {}", std::process::id());
    }

    write_pid_file(&pid_path)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let result = runtime.block_on(run(config, !args.daemonize));

    info!("Shutting down...");
    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("Bridge daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

async fn run(mut config: BridgeConfig, console: bool) -> Result<()> {
    let sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    ensure_token(&mut config).await?;

    let server = DaemonServer::new(config)?;
    server
        .run(shutdown_signal(sigterm, sigint), console)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_args_become_overrides() {
        let args = Args::parse_from([
            "bridge-daemon",
            "--port",
            "7000",
            "--max-sessions",
            "2",
            "--backend",
            "ollama",
        ]);
        let mut config = BridgeConfig::default();
        args.overrides().apply(&mut config);

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.max_sessions, 2);
        assert_eq!(config.backend.kind, BackendKind::Ollama);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_pid_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("bridge.pid");

        write_pid_file(&path).unwrap();
        let written: u32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id());

        remove_pid_file(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_live_pid_blocks_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.pid");
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        assert!(check_existing_daemon(&path).is_err());
        assert!(path.exists());
    }

    #[test]
    fn test_stale_pid_file_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.pid");
        // pid_max on Linux is at most 2^22
        fs::write(&path, "99999999\n").unwrap();

        check_existing_daemon(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_garbage_pid_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.pid");
        fs::write(&path, "not-a-pid").unwrap();
        assert!(check_existing_daemon(&path).is_err());
    }

    #[tokio::test]
    async fn test_ensure_token_generates_and_writes() {
        let dir = TempDir::new().unwrap();
        let mut config = BridgeConfig::for_testing(dir.path());
        config.auth.token = None;

        ensure_token(&mut config).await.unwrap();

        let token = config.auth.token.clone().unwrap();
        let on_disk = AuthToken::read_from_file(&config.auth.token_file).await.unwrap();
        assert_eq!(on_disk.expose(), token);
    }

    #[tokio::test]
    async fn test_ensure_token_keeps_configured() {
        let dir = TempDir::new().unwrap();
        let mut config = BridgeConfig::for_testing(dir.path());

        ensure_token(&mut config).await.unwrap();

        assert_eq!(config.auth.token.as_deref(), Some("abc123"));
        assert!(!config.auth.token_file.exists());
    }
}
