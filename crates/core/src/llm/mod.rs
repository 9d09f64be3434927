//! Clients for the scoring model.
//!
//! The scoring stage talks to a locally served instruction model. Two server
//! flavours are supported: Ollama's native chat API and the OpenAI-compatible
//! chat completions API exposed by vLLM and the llama.cpp server.

mod ollama;
mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::LLM_TOKENS;
use crate::pipeline::StageError;

pub use ollama::OllamaClient;
pub use openai::OpenAiCompatibleClient;

/// Error type for LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("LLM not configured: {0}")]
    NotConfigured(String),
}

impl LlmError {
    fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            LlmError::Timeout(timeout)
        } else {
            LlmError::Http(e.to_string())
        }
    }
}

impl From<LlmError> for StageError {
    fn from(e: LlmError) -> Self {
        match &e {
            // Client errors other than throttling will fail the same way again
            LlmError::Api { status, .. }
                if (400..500).contains(status) && *status != 408 && *status != 429 =>
            {
                StageError::fatal(e.to_string())
            }
            LlmError::NotConfigured(_) => StageError::fatal(e.to_string()),
            _ => StageError::retryable(e.to_string()),
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A chat completion request: one system and one user message.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens: 2048,
            temperature: 0.1,
            top_p: 0.9,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }
}

/// Response from a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: LlmUsage,
    /// Model that answered, as reported by the server.
    pub model: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name ("ollama", "openai_compatible").
    fn provider(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Count token usage of one completion.
pub(crate) fn record_usage(provider: &str, usage: &LlmUsage) {
    LLM_TOKENS
        .with_label_values(&[provider, "input"])
        .inc_by(usage.input_tokens as u64);
    LLM_TOKENS
        .with_label_values(&[provider, "output"])
        .inc_by(usage.output_tokens as u64);
}

/// Scoring model server flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Ollama native API.
    #[default]
    Ollama,
    /// OpenAI-compatible chat completions (vLLM, llama.cpp server).
    OpenaiCompatible,
}

/// `[llm]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,

    #[serde(default = "default_model")]
    pub model: String,

    /// Server base URL. Defaults per provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,

    /// Bearer token, if the server wants one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_model() -> String {
    "llama-3-8b-instruct".to_string()
}

fn default_timeout() -> u64 {
    600
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: default_model(),
            api_base: None,
            api_key: None,
            timeout_secs: default_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Build the client selected by `config`.
pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    if config.model.trim().is_empty() {
        return Err(LlmError::NotConfigured("llm.model is empty".to_string()));
    }

    let client: Arc<dyn LlmClient> = match config.provider {
        LlmProvider::Ollama => {
            let mut client = OllamaClient::new(config.model.clone(), config.timeout())?;
            if let Some(ref api_base) = config.api_base {
                client = client.with_api_base(api_base.clone());
            }
            Arc::new(client)
        }
        LlmProvider::OpenaiCompatible => {
            let mut client = OpenAiCompatibleClient::new(config.model.clone(), config.timeout())?;
            if let Some(ref api_base) = config.api_base {
                client = client.with_api_base(api_base.clone());
            }
            if let Some(ref api_key) = config.api_key {
                client = client.with_api_key(api_key.clone());
            }
            Arc::new(client)
        }
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_request_builder() {
        let request = CompletionRequest::new("Score this call")
            .with_system("You are a QA analyst")
            .with_max_tokens(512)
            .with_temperature(0.2)
            .with_top_p(0.8);

        assert_eq!(request.prompt, "Score this call");
        assert_eq!(request.system.as_deref(), Some("You are a QA analyst"));
        assert_eq!(request.max_tokens, 512);
        assert_eq!(request.temperature, 0.2);
        assert_eq!(request.top_p, 0.8);
    }

    #[test]
    fn test_error_classification() {
        let throttled = LlmError::Api {
            status: 429,
            message: "slow down".to_string(),
        };
        assert!(StageError::from(throttled).is_retryable());

        let bad_request = LlmError::Api {
            status: 400,
            message: "context length exceeded".to_string(),
        };
        assert!(!StageError::from(bad_request).is_retryable());

        let unavailable = LlmError::Api {
            status: 503,
            message: "loading model".to_string(),
        };
        assert!(StageError::from(unavailable).is_retryable());
        assert!(StageError::from(LlmError::Http("refused".into())).is_retryable());
    }

    #[test]
    fn test_config_from_toml() {
        let config: LlmConfig = toml::from_str(
            r#"
            provider = "openai_compatible"
            model = "meta-llama/Meta-Llama-3-8B-Instruct"
            api_base = "http://vllm:8000"
            "#,
        )
        .unwrap();
        assert_eq!(config.provider, LlmProvider::OpenaiCompatible);
        assert_eq!(config.timeout_secs, 600);

        let client = create_llm_client(&config).unwrap();
        assert_eq!(client.provider(), "openai_compatible");
        assert_eq!(client.model(), "meta-llama/Meta-Llama-3-8B-Instruct");
    }

    #[test]
    fn test_default_provider_is_ollama() {
        let client = create_llm_client(&LlmConfig::default()).unwrap();
        assert_eq!(client.provider(), "ollama");
        assert_eq!(client.model(), "llama-3-8b-instruct");
    }

    #[test]
    fn test_empty_model_rejected() {
        let config = LlmConfig {
            model: " ".to_string(),
            ..LlmConfig::default()
        };
        assert!(matches!(
            create_llm_client(&config),
            Err(LlmError::NotConfigured(_))
        ));
    }
}
