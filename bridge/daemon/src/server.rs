//! Daemon Server Implementation
//!
//! The process-level loop around [`Bridge`]:
//! - Binds the WebSocket listener on the configured host, port and path
//! - Runs the bridge accept loop until shutdown
//! - Sweeps the resource store every cleanup interval
//! - Reads admin commands from stdin when attached to a terminal
//!
//! ```text
//!                      DaemonServer
//!                           │
//!         ┌─────────────────┼──────────────────┐
//!         │                 │                  │
//!    WsListener        sweeper task      stdin console
//!         │                 │                  │
//!   Bridge::serve   ResourceManager    CommandProcessor
//! ```

use std::future::Future;

use anyhow::{Context, Result};
use bridge_core::{Bridge, BridgeConfig, CommandProcessor, WsListener};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The main daemon server
pub struct DaemonServer {
    config: BridgeConfig,
    bridge: Bridge,
}

impl DaemonServer {
    /// Build the bridge for a resolved configuration
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let bridge = Bridge::from_config(&config).context("Failed to build bridge")?;
        Ok(Self { config, bridge })
    }

    /// Serve until `shutdown` resolves, then close every session
    pub async fn run<F>(&self, shutdown: F, console: bool) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.config.listen_addr();
        let mut listener = WsListener::bind(&addr, &self.config.server.path)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;

        info!(
            addr = %addr,
            path = %self.config.server.path,
            max_sessions = self.config.server.max_sessions,
            "Listening for avatar clients"
        );

        let sweeper = self.bridge.spawn_sweeper();
        let console_task = console.then(|| spawn_console(self.bridge.commands()));

        let result = self
            .bridge
            .serve(&mut listener, shutdown)
            .await
            .context("Accept loop failed");

        sweeper.abort();
        if let Some(task) = console_task {
            task.abort();
        }

        let report = self.bridge.sweep().await;
        debug!(removed = report.removed, "Final sweep");
        info!("Shutdown complete");
        result
    }
}

/// Read admin commands from stdin until it closes
fn spawn_console(commands: CommandProcessor) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Admin console ready (type `help`)");
        run_console(BufReader::new(tokio::io::stdin()), &commands, |text| {
            println!("{text}");
        })
        .await;
    })
}

/// Execute each non-empty line, handing output or error text to `print`
async fn run_console<R, P>(reader: R, commands: &CommandProcessor, mut print: P)
where
    R: AsyncBufRead + Unpin,
    P: FnMut(&str),
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match commands.run_line(&line).await {
                    Ok(output) => print(&output.to_string()),
                    Err(e) => print(&format!("error: {e}")),
                }
            }
            Ok(None) => {
                debug!("Console input closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Console read failed");
                break;
            }
        }
    }
}
