//! Provider clients
//!
//! Each agent wraps one call to an external generative-AI provider. The
//! clients here perform a single call and classify failures; the retry loop
//! is owned by the executor, not the client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

mod anthropic;
mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use crate::config::{ProviderConfig, ProviderKind};
use runledger::AgentDef;

/// Errors from a single provider call
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Transient failures worth a backoff-and-retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Api { status, .. } => matches!(status, 408 | 529) || *status >= 500,
            Self::Network(_) => true,
            Self::Auth(_) => false,
            Self::InvalidResponse(_) => false,
        }
    }

    /// Authentication/validation failures: never retried, terminal at once
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Auth(_) => true,
            Self::Api { status, .. } => matches!(status, 400 | 401 | 403 | 404 | 422),
            Self::InvalidResponse(_) => true,
            _ => false,
        }
    }
}

/// One provider call, assembled from the agent definition
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub agent: String,
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl InvocationRequest {
    /// Build the request for an agent's configured behavior
    pub fn from_agent(def: &AgentDef) -> Self {
        Self {
            agent: def.name.clone(),
            model: def.model.clone(),
            prompt: def.prompt.clone(),
            temperature: def.temperature,
            max_tokens: def.max_tokens,
        }
    }
}

/// What a successful call actually cost, from the provider response
#[derive(Debug, Clone, Default)]
pub struct InvocationOutput {
    pub items_processed: i64,
    pub items_failed: i64,
    pub tokens_used: i64,
    pub cost_usd: f64,
}

/// A provider backend capable of executing agent work
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name agents reference in their `provider` field
    fn name(&self) -> &str;

    /// Perform one call; no internal retries
    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationOutput, ProviderError>;
}

/// Create a provider client from configuration
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    debug!(provider = %config.name, kind = ?config.kind, "create_provider: called");
    match config.kind {
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicProvider::from_config(config)?)),
        ProviderKind::Openai => Ok(Arc::new(OpenAiProvider::from_config(config)?)),
    }
}

/// The set of configured providers plus the global fallback choice
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: std::collections::HashMap<String, Arc<dyn Provider>>,
    fallback: Option<String>,
}

impl ProviderRegistry {
    /// Build every configured provider client
    pub fn from_config(config: &crate::config::Config) -> Result<Self, ProviderError> {
        let mut registry = Self::default();
        for provider_config in &config.providers {
            registry.insert(create_provider(provider_config)?);
        }
        registry.fallback = config.fallback_provider.clone();
        Ok(registry)
    }

    /// Register a provider under its own name
    pub fn insert(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Builder: set the fallback provider name
    pub fn with_fallback(mut self, fallback: Option<String>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Look up a provider by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Resolve an agent's primary provider and the fallback, if distinct
    pub fn pair_for(&self, def: &AgentDef) -> Option<(Arc<dyn Provider>, Option<Arc<dyn Provider>>)> {
        let primary = self.get(&def.provider)?;
        let fallback = self
            .fallback
            .as_deref()
            .filter(|name| *name != def.provider)
            .and_then(|name| self.get(name));
        Some((primary, fallback))
    }
}

/// Read the API key for a provider from its configured environment variable
pub(crate) fn api_key_from_env(config: &ProviderConfig) -> Result<String, ProviderError> {
    std::env::var(&config.api_key_env).map_err(|_| {
        ProviderError::Auth(format!(
            "API key for '{}' not found in {}",
            config.name, config.api_key_env
        ))
    })
}

/// Parse a Retry-After header value, defaulting to 60s
pub(crate) fn retry_after_from_header(value: Option<&reqwest::header::HeaderValue>) -> Duration {
    let secs = value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(60);
    Duration::from_secs(secs)
}

/// Cost in USD from actual token usage and configured per-mtok pricing
pub(crate) fn cost_from_usage(config: &ProviderConfig, input_tokens: i64, output_tokens: i64) -> f64 {
    input_tokens as f64 * config.input_cost_per_mtok / 1_000_000.0
        + output_tokens as f64 * config.output_cost_per_mtok / 1_000_000.0
}
