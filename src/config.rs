//! Request options and layered configuration.
//!
//! Options supplied per call are merged with provider defaults and
//! environment credentials into a [`ProviderConfig`] by the `FetchConfig`
//! plug: defaults ← environment ← per-call options (rightmost wins).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheOptions;
use crate::context::ContextOptions;
use crate::flow::FlowOptions;
use crate::http::BackoffConfig;
use crate::providers::ProviderId;
use crate::recovery::RecoveryOptions;

/// Default timeout for synchronous requests.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for streaming requests.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Structured output format requested from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Free-form JSON object output.
    JsonObject,
    /// JSON constrained to a schema.
    JsonSchema {
        /// The JSON schema the output must satisfy.
        schema: Value,
    },
}

/// Tool selection directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Let the model decide.
    Auto,
    /// Forbid tool calls.
    None,
    /// Force a specific tool by name.
    Named(String),
}

/// A tool definition passed to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// JSON schema of the tool's parameters.
    pub parameters: Value,
}

/// Transport retry options, resolved into a [`BackoffConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Whether transport retry is enabled. Default: `true`.
    pub enabled: bool,
    /// Maximum retry attempts. Default: 3.
    pub attempts: u32,
    /// Delay before the first retry, in milliseconds. Default: 1000.
    pub initial_delay_ms: u64,
    /// Multiplier applied after each retry. Default: 2.0.
    pub backoff: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 3,
            initial_delay_ms: 1000,
            backoff: 2.0,
        }
    }
}

impl RetryOptions {
    /// Resolve into the transport-level backoff configuration.
    pub fn to_backoff(&self) -> BackoffConfig {
        if !self.enabled {
            return BackoffConfig::none();
        }
        BackoffConfig {
            max_retries: self.attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.backoff,
            ..BackoffConfig::standard()
        }
    }
}

/// User-supplied options for a single call.
///
/// All fields are optional; unset fields fall back to provider defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Model identifier. Defaults to the provider's default model.
    pub model: Option<String>,
    /// Sampling temperature (0..2).
    pub temperature: Option<f64>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Nucleus sampling probability (0..1).
    pub top_p: Option<f64>,
    /// Top-k sampling cutoff.
    pub top_k: Option<u32>,
    /// Frequency penalty.
    pub frequency_penalty: Option<f64>,
    /// Presence penalty.
    pub presence_penalty: Option<f64>,
    /// Stop sequences.
    pub stop: Option<Vec<String>>,
    /// Deterministic sampling seed.
    pub seed: Option<u64>,
    /// End-user identifier forwarded to the provider.
    pub user: Option<String>,
    /// Structured output format.
    pub response_format: Option<ResponseFormat>,
    /// Tool definitions.
    pub tools: Option<Vec<ToolSpec>>,
    /// Tool selection directive.
    pub tool_choice: Option<ToolChoice>,
    /// Request timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Transport retry settings.
    pub retry: Option<RetryOptions>,
    /// Response cache settings.
    pub cache: Option<CacheOptions>,
    /// Stream recovery settings.
    pub stream_recovery: Option<RecoveryOptions>,
    /// Stream flow-control settings.
    pub flow_control: Option<FlowOptions>,
    /// Context-management settings.
    pub context: Option<ContextOptions>,
    /// API key override (takes precedence over the environment).
    pub api_key: Option<String>,
    /// Base URL override.
    pub base_url: Option<String>,
    /// Organization header (OpenAI-style).
    pub organization: Option<String>,
}

impl RequestOptions {
    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the generation token limit.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the API key override.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL override.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Enable caching with the given TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = Some(CacheOptions {
            enabled: true,
            ttl,
        });
        self
    }

    /// Validate option ranges. Rejects out-of-range sampling parameters.
    pub fn validate(&self) -> crate::error::Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(crate::error::Error::InvalidRequest(format!(
                    "temperature {} outside 0..2",
                    t
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(crate::error::Error::InvalidRequest(format!(
                    "top_p {} outside 0..1",
                    p
                )));
            }
        }
        Ok(())
    }
}

/// Effective configuration for one call, produced by the `FetchConfig` plug.
///
/// Merge order: provider defaults ← environment ← [`RequestOptions`].
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Resolved model identifier.
    pub model: String,
    /// Resolved base URL.
    pub base_url: String,
    /// Resolved API key, if the provider needs one.
    pub api_key: Option<String>,
    /// Organization header, if set.
    pub organization: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
    /// Transport retry configuration.
    pub retry: BackoffConfig,
}

/// The environment variable holding the API key for a provider, if any.
pub fn api_key_env_var(provider: &ProviderId) -> Option<&'static str> {
    match provider {
        ProviderId::OpenAi => Some("OPENAI_API_KEY"),
        ProviderId::Anthropic => Some("ANTHROPIC_API_KEY"),
        ProviderId::Gemini => Some("GEMINI_API_KEY"),
        ProviderId::Groq => Some("GROQ_API_KEY"),
        ProviderId::Mistral => Some("MISTRAL_API_KEY"),
        ProviderId::Perplexity => Some("PERPLEXITY_API_KEY"),
        ProviderId::OpenRouter => Some("OPENROUTER_API_KEY"),
        ProviderId::XAi => Some("XAI_API_KEY"),
        ProviderId::Ollama | ProviderId::LmStudio | ProviderId::Mock => None,
        ProviderId::Custom(_) => None,
    }
}

/// The environment variable overriding the base URL for a provider, if any.
pub fn base_url_env_var(provider: &ProviderId) -> Option<&'static str> {
    match provider {
        ProviderId::Ollama => Some("OLLAMA_API_BASE"),
        ProviderId::LmStudio => Some("LMSTUDIO_API_BASE"),
        _ => None,
    }
}

/// Look up the API key for a provider from the environment.
pub fn api_key_from_env(provider: &ProviderId) -> Option<String> {
    api_key_env_var(provider)
        .and_then(|var| std::env::var(var).ok())
        .filter(|v| !v.is_empty())
}

/// Look up the base URL override for a provider from the environment.
pub fn base_url_from_env(provider: &ProviderId) -> Option<String> {
    base_url_env_var(provider)
        .and_then(|var| std::env::var(var).ok())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let opts = RequestOptions::default()
            .with_model("gpt-4o")
            .with_temperature(0.3)
            .with_max_tokens(4096);
        assert_eq!(opts.model.as_deref(), Some("gpt-4o"));
        assert_eq!(opts.temperature, Some(0.3));
        assert_eq!(opts.max_tokens, Some(4096));
    }

    #[test]
    fn test_options_validation_ranges() {
        assert!(RequestOptions::default()
            .with_temperature(0.7)
            .validate()
            .is_ok());
        assert!(RequestOptions::default()
            .with_temperature(2.5)
            .validate()
            .is_err());

        let mut opts = RequestOptions::default();
        opts.top_p = Some(1.5);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_retry_options_resolution() {
        let backoff = RetryOptions::default().to_backoff();
        assert_eq!(backoff.max_retries, 3);
        assert_eq!(backoff.initial_delay, Duration::from_millis(1000));

        let disabled = RetryOptions {
            enabled: false,
            ..Default::default()
        }
        .to_backoff();
        assert_eq!(disabled.max_retries, 0);
    }

    #[test]
    fn test_env_var_names() {
        assert_eq!(api_key_env_var(&ProviderId::OpenAi), Some("OPENAI_API_KEY"));
        assert_eq!(
            api_key_env_var(&ProviderId::Anthropic),
            Some("ANTHROPIC_API_KEY")
        );
        assert_eq!(api_key_env_var(&ProviderId::Ollama), None);
        assert_eq!(
            base_url_env_var(&ProviderId::Ollama),
            Some("OLLAMA_API_BASE")
        );
    }
}
