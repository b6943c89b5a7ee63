//! Ollama Backend Implementation
//!
//! Chat backend for Ollama (local LLM server).
//!
//! # Ollama API
//!
//! - `/api/generate` - Generate completions (used here, non-streaming)
//! - `/api/tags` - List available models (used for health checks)
//!
//! Each inbound event becomes one generate request; attachments are
//! described in the prompt context since the model only sees text.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;

use super::traits::{BackendReply, ChatBackend};
use super::BackendConfig;
use crate::convert::NormalizedChatEvent;

/// Configuration for one generate request
#[derive(Clone, Debug)]
pub struct LlmRequest {
    /// The prompt/message to send
    pub prompt: String,
    /// Model to use
    pub model: String,
    /// System prompt (optional, prepended to the prompt)
    pub system: Option<String>,
    /// Extra context placed between system prompt and prompt
    pub context: Option<String>,
}

impl LlmRequest {
    /// Create a new request with prompt and model
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            system: None,
            context: None,
        }
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set context
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Response from a generate request
#[derive(Clone, Debug)]
pub struct LlmResponse {
    /// The response text
    pub content: String,
    /// Model that generated the response
    pub model: String,
    /// Tokens used (if available)
    pub tokens_used: Option<u32>,
    /// Response generation time in milliseconds
    pub duration_ms: u64,
}

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    host: String,
    port: u16,
    model: String,
    system_prompt: Option<String>,
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(host: impl Into<String>, port: u16, model: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            host: host.into(),
            port,
            model: model.into(),
            system_prompt: None,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .context("Failed to create HTTP client")?,
        })
    }

    /// Create from `BackendConfig`
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        let mut backend = Self::new(config.host.clone(), config.port, config.model.clone())?;
        backend.system_prompt = config.system_prompt.clone();
        Ok(backend)
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Build the full prompt including system and context
    fn build_prompt(request: &LlmRequest) -> String {
        let mut full_prompt = String::new();

        if let Some(ref system) = request.system {
            full_prompt.push_str(system);
            full_prompt.push_str("\n\n");
        }

        if let Some(ref context) = request.context {
            full_prompt.push_str(context);
            full_prompt.push('\n');
        }

        full_prompt.push_str(&request.prompt);
        full_prompt
    }

    fn request_for(&self, event: &NormalizedChatEvent) -> LlmRequest {
        let mut request = LlmRequest::new(event.content.clone(), self.model.clone());
        if let Some(system) = &self.system_prompt {
            request = request.with_system(system.clone());
        }
        if !event.attachments.is_empty() {
            let described: Vec<String> = event
                .attachments
                .iter()
                .map(|a| format!("{} ({}, {} bytes)", a.kind, a.mime, a.size))
                .collect();
            request = request.with_context(format!("[attachments: {}]", described.join(", ")));
        }
        request
    }

    /// Send a request and wait for the complete response
    ///
    /// # Errors
    ///
    /// Fails on connection errors, non-success status, or an unparsable body.
    pub async fn send(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse> {
        let start = Instant::now();
        let json_request = serde_json::json!({
            "model": request.model,
            "prompt": Self::build_prompt(request),
            "stream": false,
        });

        let response = self
            .http_client
            .post(self.generate_url())
            .json(&json_request)
            .send()
            .await
            .context("Ollama request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let data: serde_json::Value = response.json().await?;

        let content = data
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string();

        let tokens_used = data
            .get("eval_count")
            .and_then(serde_json::Value::as_u64)
            .and_then(|c| u32::try_from(c).ok());

        Ok(LlmResponse {
            content,
            model: request.model.clone(),
            tokens_used,
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn handle_event(
        &self,
        event: &NormalizedChatEvent,
    ) -> anyhow::Result<Option<BackendReply>> {
        let response = self.send(&self.request_for(event)).await?;
        tracing::debug!(
            model = %response.model,
            tokens = ?response.tokens_used,
            duration_ms = response.duration_ms,
            "Ollama reply received"
        );
        if response.content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(
            BackendReply::text(response.content).with_reply_to(event.message_id.clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{AttachmentRef, InputSource};
    use crate::manager::ClientId;
    use crate::resource::{ResourceKind, Rid};

    #[test]
    fn test_ollama_backend_creation() {
        let backend = OllamaBackend::new("localhost", 11434, "llama3.2").unwrap();
        assert_eq!(backend.host, "localhost");
        assert_eq!(backend.port, 11434);
        assert_eq!(backend.base_url(), "http://localhost:11434");
    }

    #[test]
    fn test_build_prompt() {
        // Simple prompt
        let request = LlmRequest::new("Hello", "test");
        assert_eq!(OllamaBackend::build_prompt(&request), "Hello");

        // With both
        let request = LlmRequest::new("Hello", "test")
            .with_system("Be helpful")
            .with_context("Previous: Hi");
        assert_eq!(
            OllamaBackend::build_prompt(&request),
            "Be helpful\n\nPrevious: Hi\nHello"
        );
    }

    #[test]
    fn test_from_config_and_attachment_context() {
        let config = BackendConfig {
            host: "example.com".to_string(),
            port: 8080,
            system_prompt: Some("You are an avatar".into()),
            ..BackendConfig::default()
        };
        let backend = OllamaBackend::from_config(&config).unwrap();
        assert_eq!(backend.generate_url(), "http://example.com:8080/api/generate");

        let event = NormalizedChatEvent {
            client_id: ClientId::from("c"),
            message_id: "1".into(),
            content: "what is this?".into(),
            attachments: vec![AttachmentRef {
                rid: Rid::from("res-a-1"),
                kind: ResourceKind::Image,
                mime: "image/png".into(),
                size: 42,
            }],
            emotion_hint: None,
            source: InputSource::Chat,
            timestamp: 0,
            warnings: Vec::new(),
        };
        let request = backend.request_for(&event);
        assert_eq!(request.model, "llama3.2");
        assert_eq!(
            OllamaBackend::build_prompt(&request),
            "You are an avatar\n\n[attachments: image (image/png, 42 bytes)]\nwhat is this?"
        );
    }
}
