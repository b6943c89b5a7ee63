//! Chat Backend Integration
//!
//! This module connects the bridge to whatever produces replies through the
//! [`ChatBackend`] trait.
//!
//! # Available Backends
//!
//! - **Echo**: replies `Received: <text>`; standalone mode (default)
//! - **Ollama**: forwards text to a local Ollama server
//!
//! # Usage
//!
//! ```ignore
//! use bridge_core::backend::{build_backend, BackendConfig};
//!
//! let backend = build_backend(&BackendConfig::default())?;
//! let reply = backend.handle_event(&event).await?;
//! ```

mod ollama;
mod traits;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use ollama::{LlmRequest, LlmResponse, OllamaBackend};
pub use traits::{BackendReply, ChatBackend, EchoBackend, MediaSource, VoiceClip};

/// Which backend to run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// [`EchoBackend`]
    #[default]
    Echo,
    /// [`OllamaBackend`]
    Ollama,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "echo" => Ok(Self::Echo),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown backend `{other}` (expected echo or ollama)")),
        }
    }
}

/// Backend selection and connection settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend to run
    pub kind: BackendKind,
    /// Ollama host
    pub host: String,
    /// Ollama port
    pub port: u16,
    /// Ollama model
    pub model: String,
    /// Optional system prompt
    pub system_prompt: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Echo,
            host: "localhost".into(),
            port: 11434,
            model: "llama3.2".into(),
            system_prompt: None,
        }
    }
}

/// Build the configured backend
///
/// # Errors
///
/// Fails when the HTTP client for a network backend cannot be created.
pub fn build_backend(config: &BackendConfig) -> anyhow::Result<Arc<dyn ChatBackend>> {
    Ok(match config.kind {
        BackendKind::Echo => Arc::new(EchoBackend),
        BackendKind::Ollama => Arc::new(OllamaBackend::from_config(config)?),
    })
}
