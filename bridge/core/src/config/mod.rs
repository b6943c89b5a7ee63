//! TOML Configuration File Support
//!
//! Centralized configuration for the bridge, read from
//! `~/.config/avatar-bridge/bridge.toml` by default.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`BRIDGE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/avatar-bridge/bridge.toml` for the file
//! - `$XDG_RUNTIME_DIR/avatar-bridge/bridge.token` for a generated token
//! - `$XDG_CACHE_HOME/avatar-bridge/resources` for spilled resources
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 9090
//! path = "/bridge"
//! max_sessions = 2
//! kick_old = true
//!
//! [auth]
//! token = "abc123"
//!
//! [session]
//! idle_timeout_secs = 120
//! max_message_length = 2000
//!
//! [resource]
//! base_url = "http://127.0.0.1:9091"
//! max_resource_bytes = 8388608
//! ttl_secs = 86400
//!
//! [output]
//! auto_emotion = true
//!
//! [[output.expressions]]
//! name = "happy"
//! keywords = ["happy", "glad"]
//! motion = "TapBody"
//!
//! [backend]
//! kind = "ollama"
//! model = "llama3.2"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendConfig, BackendKind};
use crate::convert::{ExpressionEntry, OutputConfig};
use crate::manager::ManagerConfig;
use crate::resource::{ResourceConfig, MIN_CLEANUP_INTERVAL};
use crate::session::{default_token_path, SessionConfig, RUNTIME_DIR_NAME};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen host
    pub host: Option<String>,
    /// Listen port
    pub port: Option<u16>,
    /// WebSocket upgrade path
    pub path: Option<String>,
    /// Session ceiling
    pub max_sessions: Option<usize>,
    /// Evict the oldest session at the ceiling
    pub kick_old: Option<bool>,
}

/// `[auth]` section
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthToml {
    /// Shared bearer token
    pub token: Option<String>,
    /// Where a generated token is written
    pub token_file: Option<PathBuf>,
}

impl fmt::Debug for AuthToml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToml")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_file", &self.token_file)
            .finish()
    }
}

/// `[session]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Deadline from accept to ready, in seconds
    pub handshake_timeout_secs: Option<u64>,
    /// Inbound silence before closing, in seconds
    pub idle_timeout_secs: Option<u64>,
    /// Inbound silence before pinging, in seconds
    pub ping_interval_secs: Option<u64>,
    /// Outbound drain bound, in milliseconds
    pub flush_timeout_ms: Option<u64>,
    /// Outbound queue length
    pub outbound_capacity: Option<usize>,
    /// Post-auth decode errors tolerated
    pub max_decode_errors: Option<u32>,
    /// Outbound reference pin lifetime, in seconds
    pub ack_timeout_secs: Option<u64>,
    /// Longest chat text in characters
    pub max_message_length: Option<usize>,
}

/// `[resource]` section
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceToml {
    /// Spill directory
    pub storage_dir: Option<PathBuf>,
    /// Base URL of the byte server
    pub base_url: Option<String>,
    /// URL path prefix
    pub path: Option<String>,
    /// URL access token
    pub token: Option<String>,
    /// Inline `data:` URI ceiling
    pub max_inline_bytes: Option<u64>,
    /// In-memory ceiling
    pub memory_threshold_bytes: Option<u64>,
    /// Per-resource ceiling
    pub max_resource_bytes: Option<u64>,
    /// Total byte quota
    pub max_total_bytes: Option<u64>,
    /// Entry quota
    pub max_entries: Option<usize>,
    /// Unreferenced lifetime, in seconds
    pub ttl_secs: Option<u64>,
    /// Release-to-reclaim delay, in seconds
    pub grace_secs: Option<u64>,
    /// Lifetime of an uncommitted upload, in seconds
    pub pending_ttl_secs: Option<u64>,
    /// Sweep period, in seconds
    pub cleanup_interval_secs: Option<u64>,
}

impl fmt::Debug for ResourceToml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceToml")
            .field("storage_dir", &self.storage_dir)
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// `[output]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputToml {
    /// Run the emotion tagger when no hint is present
    pub auto_emotion: Option<bool>,
    /// Duration estimate per character
    pub ms_per_char: Option<u64>,
    /// Segment duration floor
    pub min_segment_ms: Option<u64>,
    /// Replacement expression table
    pub expressions: Option<Vec<ExpressionEntry>>,
}

/// `[backend]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// `echo` or `ollama`
    pub kind: Option<String>,
    /// Ollama host
    pub host: Option<String>,
    /// Ollama port
    pub port: Option<u16>,
    /// Ollama model
    pub model: Option<String>,
    /// System prompt
    pub system_prompt: Option<String>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeToml {
    /// Listener settings
    pub server: ServerToml,
    /// Credential settings
    pub auth: AuthToml,
    /// Per-session limits
    pub session: SessionToml,
    /// Resource store settings
    pub resource: ResourceToml,
    /// Output conversion settings
    pub output: OutputToml,
    /// Backend selection
    pub backend: BackendToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Listener and admission settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// WebSocket upgrade path
    pub path: String,
    /// Session ceiling
    pub max_sessions: usize,
    /// Evict the oldest session at the ceiling instead of refusing
    pub kick_old: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9090,
            path: "/bridge".into(),
            max_sessions: 1,
            kick_old: false,
        }
    }
}

/// Credential settings
#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Shared bearer token; generated at startup when absent
    pub token: Option<String>,
    /// Where a generated token is written
    pub token_file: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_file: default_token_path(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_file", &self.token_file)
            .finish()
    }
}

/// Complete bridge configuration
///
/// Every recognized option with its default. Use [`load_config`] to layer
/// the file and environment on top, then [`ConfigOverrides::apply`] for CLI
/// arguments, then [`BridgeConfig::validate`].
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Listener and admission
    pub server: ServerConfig,
    /// Credential
    pub auth: AuthConfig,
    /// Per-session limits
    pub session: SessionConfig,
    /// Resource store
    pub resource: ResourceConfig,
    /// Output conversion
    pub output: OutputConfig,
    /// Backend selection
    pub backend: BackendConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            session: SessionConfig::default(),
            resource: ResourceConfig::default(),
            output: OutputConfig::default(),
            backend: BackendConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loopback config with a fixed token, short timeouts, and storage under `dir`
    #[must_use]
    pub fn for_testing(dir: &Path) -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                ..ServerConfig::default()
            },
            auth: AuthConfig {
                token: Some("abc123".into()),
                token_file: dir.join("bridge.token"),
            },
            session: SessionConfig {
                flush_timeout: Duration::from_millis(200),
                ..SessionConfig::default()
            },
            resource: ResourceConfig::for_testing(dir.join("resources")),
            ..Self::default()
        }
    }

    /// Get the layer that last changed this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// `host:port` for the listener
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Admission policy for the session manager
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_sessions: self.server.max_sessions,
            kick_old: self.server.kick_old,
        }
    }

    /// Reject unusable values and clamp the sweep period
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] naming the first offending option.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.server.max_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_sessions must be at least 1".into(),
            ));
        }
        if self.server.path.is_empty() {
            return Err(ConfigError::ValidationError(
                "server.path must not be empty".into(),
            ));
        }
        if !self.server.path.starts_with('/') {
            self.server.path.insert(0, '/');
        }
        if self.session.outbound_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "session.outbound_capacity must be at least 1".into(),
            ));
        }
        if self.resource.max_inline_bytes > self.resource.max_resource_bytes {
            return Err(ConfigError::ValidationError(format!(
                "resource.max_inline_bytes ({}) exceeds resource.max_resource_bytes ({})",
                self.resource.max_inline_bytes, self.resource.max_resource_bytes
            )));
        }
        if self.resource.cleanup_interval < MIN_CLEANUP_INTERVAL {
            tracing::warn!(
                configured_secs = self.resource.cleanup_interval.as_secs(),
                min_secs = MIN_CLEANUP_INTERVAL.as_secs(),
                "Cleanup interval too short, clamping"
            );
            self.resource.cleanup_interval = MIN_CLEANUP_INTERVAL;
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/avatar-bridge/bridge.toml` or
/// `~/.config/avatar-bridge/bridge.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(RUNTIME_DIR_NAME).join("bridge.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration, reading variables through `env`
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or names an unknown backend.
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    let mut config = BridgeConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: BridgeToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    Ok(config)
}

fn parse_backend(kind: &str) -> Result<BackendKind, ConfigError> {
    kind.parse().map_err(ConfigError::ValidationError)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut BridgeConfig, toml: BridgeToml) -> Result<(), ConfigError> {
    let BridgeToml {
        server,
        auth,
        session,
        resource,
        output,
        backend,
    } = toml;

    // Server settings
    if let Some(host) = server.host {
        config.server.host = host;
    }
    if let Some(port) = server.port {
        config.server.port = port;
    }
    if let Some(path) = server.path {
        config.server.path = path;
    }
    if let Some(max) = server.max_sessions {
        config.server.max_sessions = max;
    }
    if let Some(kick) = server.kick_old {
        config.server.kick_old = kick;
    }

    // Auth settings
    if auth.token.is_some() {
        config.auth.token = auth.token;
    }
    if let Some(path) = auth.token_file {
        config.auth.token_file = path;
    }

    // Session settings
    let s = &mut config.session;
    if let Some(secs) = session.handshake_timeout_secs {
        s.handshake_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = session.idle_timeout_secs {
        s.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = session.ping_interval_secs {
        s.ping_interval = Duration::from_secs(secs);
    }
    if let Some(ms) = session.flush_timeout_ms {
        s.flush_timeout = Duration::from_millis(ms);
    }
    if let Some(capacity) = session.outbound_capacity {
        s.outbound_capacity = capacity;
    }
    if let Some(max) = session.max_decode_errors {
        s.max_decode_errors = max;
    }
    if let Some(secs) = session.ack_timeout_secs {
        s.ack_timeout = Duration::from_secs(secs);
    }
    if let Some(len) = session.max_message_length {
        s.max_message_length = len;
    }

    // Resource settings
    let r = &mut config.resource;
    if let Some(dir) = resource.storage_dir {
        r.storage_dir = dir;
    }
    if let Some(url) = resource.base_url {
        r.base_url = url;
    }
    if let Some(path) = resource.path {
        r.path = path;
    }
    if resource.token.is_some() {
        r.token = resource.token;
    }
    if let Some(bytes) = resource.max_inline_bytes {
        r.max_inline_bytes = bytes;
    }
    if let Some(bytes) = resource.memory_threshold_bytes {
        r.memory_threshold_bytes = bytes;
    }
    if let Some(bytes) = resource.max_resource_bytes {
        r.max_resource_bytes = bytes;
    }
    if let Some(bytes) = resource.max_total_bytes {
        r.max_total_bytes = bytes;
    }
    if let Some(entries) = resource.max_entries {
        r.max_entries = entries;
    }
    if let Some(secs) = resource.ttl_secs {
        r.ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = resource.grace_secs {
        r.grace = Duration::from_secs(secs);
    }
    if let Some(secs) = resource.pending_ttl_secs {
        r.pending_ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = resource.cleanup_interval_secs {
        r.cleanup_interval = Duration::from_secs(secs);
    }

    // Output settings
    if let Some(auto) = output.auto_emotion {
        config.output.auto_emotion = auto;
    }
    if let Some(ms) = output.ms_per_char {
        config.output.ms_per_char = ms;
    }
    if let Some(ms) = output.min_segment_ms {
        config.output.min_segment_ms = ms;
    }
    if let Some(table) = output.expressions {
        config.output.expressions = table;
    }

    // Backend settings
    if let Some(kind) = backend.kind {
        config.backend.kind = parse_backend(&kind)?;
    }
    if let Some(host) = backend.host {
        config.backend.host = host;
    }
    if let Some(port) = backend.port {
        config.backend.port = port;
    }
    if let Some(model) = backend.model {
        config.backend.model = model;
    }
    if backend.system_prompt.is_some() {
        config.backend.system_prompt = backend.system_prompt;
    }

    Ok(())
}

/// Parse an environment value, logging and skipping bad input
fn env_parse<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value, "Ignoring unparsable environment value");
            None
        }
    }
}

fn env_bool(value: &str) -> bool {
    let value = value.trim();
    value != "0" && !value.eq_ignore_ascii_case("false") && !value.eq_ignore_ascii_case("no")
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut BridgeConfig, env: impl Fn(&str) -> Option<String>) {
    let mut touched = false;
    let mut var = |key: &str| {
        let value = env(key);
        touched |= value.is_some();
        value
    };

    // Server settings from environment
    if let Some(host) = var("BRIDGE_HOST") {
        config.server.host = host;
    }
    if let Some(port) = var("BRIDGE_PORT").and_then(|v| env_parse("BRIDGE_PORT", &v)) {
        config.server.port = port;
    }
    if let Some(path) = var("BRIDGE_PATH") {
        config.server.path = path;
    }
    if let Some(max) = var("BRIDGE_MAX_SESSIONS").and_then(|v| env_parse("BRIDGE_MAX_SESSIONS", &v)) {
        config.server.max_sessions = max;
    }
    if let Some(kick) = var("BRIDGE_KICK_OLD") {
        config.server.kick_old = env_bool(&kick);
    }

    // Auth and session settings from environment
    if let Some(token) = var("BRIDGE_AUTH_TOKEN") {
        config.auth.token = Some(token);
    }
    if let Some(secs) =
        var("BRIDGE_IDLE_TIMEOUT").and_then(|v| env_parse::<u64>("BRIDGE_IDLE_TIMEOUT", &v))
    {
        config.session.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = var("BRIDGE_HANDSHAKE_TIMEOUT")
        .and_then(|v| env_parse::<u64>("BRIDGE_HANDSHAKE_TIMEOUT", &v))
    {
        config.session.handshake_timeout = Duration::from_secs(secs);
    }

    // Resource settings from environment
    if let Some(dir) = var("BRIDGE_RESOURCE_DIR") {
        config.resource.storage_dir = PathBuf::from(dir);
    }
    if let Some(url) = var("BRIDGE_RESOURCE_BASE_URL") {
        config.resource.base_url = url;
    }
    if let Some(token) = var("BRIDGE_RESOURCE_TOKEN") {
        config.resource.token = Some(token);
    }
    if let Some(bytes) =
        var("BRIDGE_RESOURCE_MAX_BYTES").and_then(|v| env_parse("BRIDGE_RESOURCE_MAX_BYTES", &v))
    {
        config.resource.max_resource_bytes = bytes;
    }
    if let Some(secs) =
        var("BRIDGE_RESOURCE_TTL").and_then(|v| env_parse::<u64>("BRIDGE_RESOURCE_TTL", &v))
    {
        config.resource.ttl = Duration::from_secs(secs);
    }

    // Backend settings from environment
    if let Some(kind) = var("BRIDGE_BACKEND") {
        match kind.parse() {
            Ok(kind) => config.backend.kind = kind,
            Err(e) => tracing::warn!(error = %e, "Ignoring BRIDGE_BACKEND"),
        }
    }
    if let Some(host) = var("BRIDGE_OLLAMA_HOST") {
        config.backend.host = host;
    }
    if let Some(port) = var("BRIDGE_OLLAMA_PORT").and_then(|v| env_parse("BRIDGE_OLLAMA_PORT", &v)) {
        config.backend.port = port;
    }
    if let Some(model) = var("BRIDGE_MODEL") {
        config.backend.model = model;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Default)]
pub struct ConfigOverrides {
    /// Listen host override
    pub host: Option<String>,
    /// Listen port override
    pub port: Option<u16>,
    /// Token override
    pub token: Option<String>,
    /// Session ceiling override
    pub max_sessions: Option<usize>,
    /// Backend override
    pub backend: Option<BackendKind>,
}

impl fmt::Debug for ConfigOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigOverrides")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("max_sessions", &self.max_sessions)
            .field("backend", &self.backend)
            .finish()
    }
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen host override
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set listen port override
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set token override
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set session ceiling override
    #[must_use]
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Set backend override
    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    fn is_empty(&self) -> bool {
        self.host.is_none()
            && self.port.is_none()
            && self.token.is_none()
            && self.max_sessions.is_none()
            && self.backend.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut BridgeConfig) {
        if self.is_empty() {
            return;
        }
        config.source = ConfigSource::Cli;

        if let Some(ref host) = self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref token) = self.token {
            config.auth.token = Some(token.clone());
        }
        if let Some(max) = self.max_sessions {
            config.server.max_sessions = max;
        }
        if let Some(backend) = self.backend {
            config.backend.kind = backend;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn toml_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();

        assert_eq!(config.listen_addr(), "0.0.0.0:9090");
        assert_eq!(config.server.path, "/bridge");
        assert_eq!(config.server.max_sessions, 1);
        assert!(!config.server.kick_old);
        assert_eq!(config.auth.token, None);
        assert_eq!(config.session.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.session.outbound_capacity, 64);
        assert_eq!(config.resource.max_resource_bytes, 16 * 1024 * 1024);
        assert_eq!(config.resource.ttl, Duration::from_secs(604_800));
        assert!(config.output.auto_emotion);
        assert_eq!(config.backend.kind, BackendKind::Echo);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("avatar-bridge/bridge.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = toml_file(
            r#"
[server]
host = "127.0.0.1"
port = 8765
max_sessions = 3
kick_old = true

[auth]
token = "abc123"

[session]
idle_timeout_secs = 120
max_message_length = 200

[resource]
max_resource_bytes = 1024
max_inline_bytes = 512
ttl_secs = 60
pending_ttl_secs = 45

[output]
auto_emotion = false

[[output.expressions]]
name = "joy"
keywords = ["yay"]
motion = "Jump"

[backend]
kind = "ollama"
model = "mistral"
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:8765");
        assert_eq!(config.manager_config().max_sessions, 3);
        assert!(config.manager_config().kick_old);
        assert_eq!(config.auth.token.as_deref(), Some("abc123"));
        assert_eq!(config.session.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.session.max_message_length, 200);
        assert_eq!(config.resource.max_resource_bytes, 1024);
        assert_eq!(config.resource.ttl, Duration::from_secs(60));
        assert_eq!(config.resource.pending_ttl, Duration::from_secs(45));
        assert!(!config.output.auto_emotion);
        assert_eq!(config.output.expressions.len(), 1);
        assert_eq!(config.output.expressions[0].motion.as_deref(), Some("Jump"));
        assert_eq!(config.backend.kind, BackendKind::Ollama);
        assert_eq!(config.backend.model, "mistral");
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = toml_file("[server]\nport = 7000\n");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.session.outbound_capacity, 64);
    }

    #[test]
    fn test_missing_file_graceful() {
        let config =
            load_config_with_env(Some(PathBuf::from("/nonexistent/bridge.toml")), no_env).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = toml_file("[server\nport = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let file = toml_file("[backend]\nkind = \"gpt\"\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // =========================================================================
    // Layering Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = toml_file("[server]\nport = 7000\nmax_sessions = 2\n");
        let env = env_from(&[
            ("BRIDGE_PORT", "7100"),
            ("BRIDGE_AUTH_TOKEN", "from-env"),
            ("BRIDGE_KICK_OLD", "true"),
            ("BRIDGE_RESOURCE_TTL", "30"),
            ("BRIDGE_BACKEND", "ollama"),
        ]);
        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(config.server.port, 7100);
        assert_eq!(config.server.max_sessions, 2);
        assert!(config.server.kick_old);
        assert_eq!(config.auth.token.as_deref(), Some("from-env"));
        assert_eq!(config.resource.ttl, Duration::from_secs(30));
        assert_eq!(config.backend.kind, BackendKind::Ollama);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_bad_env_value_ignored() {
        let env = env_from(&[("BRIDGE_PORT", "eighty"), ("BRIDGE_BACKEND", "gpt")]);
        let config = load_config_with_env(None, env).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.backend.kind, BackendKind::Echo);
    }

    #[test]
    fn test_cli_overrides_env() {
        let env = env_from(&[("BRIDGE_PORT", "7100"), ("BRIDGE_MAX_SESSIONS", "4")]);
        let mut config = load_config_with_env(None, env).unwrap();

        ConfigOverrides::new()
            .with_port(7200)
            .with_token("cli-token")
            .apply(&mut config);

        assert_eq!(config.server.port, 7200);
        assert_eq!(config.server.max_sessions, 4);
        assert_eq!(config.auth.token.as_deref(), Some("cli-token"));
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = BridgeConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_validate_rejects_zero_sessions() {
        let mut config = BridgeConfig::default();
        config.server.max_sessions = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_rejects_inline_above_ceiling() {
        let mut config = BridgeConfig::default();
        config.resource.max_inline_bytes = config.resource.max_resource_bytes + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_inline_bytes"));
    }

    #[test]
    fn test_validate_clamps_cleanup_interval() {
        let mut config = BridgeConfig::default();
        config.resource.cleanup_interval = Duration::from_secs(1);
        config.server.path = "bridge".into();
        config.validate().unwrap();
        assert_eq!(config.resource.cleanup_interval, MIN_CLEANUP_INTERVAL);
        assert_eq!(config.server.path, "/bridge");
    }

    #[test]
    fn test_tokens_redacted_in_debug() {
        let mut config = BridgeConfig::default();
        config.auth.token = Some("super-secret".into());
        let overrides = ConfigOverrides::new().with_token("also-secret");

        assert!(!format!("{config:?}").contains("super-secret"));
        assert!(!format!("{overrides:?}").contains("also-secret"));
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
