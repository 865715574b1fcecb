//! Anthropic Messages API provider

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{InvocationOutput, InvocationRequest, Provider, ProviderError, api_key_from_env, cost_from_usage,
            retry_after_from_header};
use crate::config::ProviderConfig;

/// Anthropic Messages API client
pub struct AnthropicProvider {
    name: String,
    api_key: String,
    base_url: String,
    http: Client,
    config: ProviderConfig,
}

impl AnthropicProvider {
    /// Create a new client from configuration
    ///
    /// Reads the API key from the environment variable named in the config.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        debug!(provider = %config.name, "from_config: called");
        let api_key = api_key_from_env(config)?;
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(ProviderError::Network)?;

        Ok(Self {
            name: config.name.clone(),
            api_key,
            base_url: config.base_url.clone(),
            http,
            config: config.clone(),
        })
    }

    /// Build the request body for the Messages API
    fn build_request_body(&self, request: &InvocationRequest) -> serde_json::Value {
        serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [
                { "role": "user", "content": request.prompt }
            ],
        })
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationOutput, ProviderError> {
        debug!(agent = %request.agent, model = %request.model, "invoke: called");
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(request);

        let response = self
            .http
            .post(url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = retry_after_from_header(response.headers().get("retry-after"));
            debug!(agent = %request.agent, ?retry_after, "invoke: rate limited (429)");
            return Err(ProviderError::RateLimited { retry_after });
        }

        if matches!(status, 401 | 403) {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Auth(text));
        }

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            debug!(agent = %request.agent, status, "invoke: API error");
            return Err(ProviderError::Api { status, message: text });
        }

        let api_response: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let input_tokens = api_response.usage.input_tokens as i64;
        let output_tokens = api_response.usage.output_tokens as i64;

        debug!(agent = %request.agent, input_tokens, output_tokens, "invoke: success");
        Ok(InvocationOutput {
            items_processed: 1,
            items_failed: 0,
            tokens_used: input_tokens + output_tokens,
            cost_usd: cost_from_usage(&self.config, input_tokens, output_tokens),
        })
    }
}

// Anthropic API response types

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider() -> AnthropicProvider {
        AnthropicProvider {
            name: "anthropic".to_string(),
            api_key: "test-key".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            http: Client::new(),
            config: ProviderConfig::default(),
        }
    }

    #[test]
    fn test_build_request_body() {
        let provider = test_provider();
        let request = InvocationRequest {
            agent: "scraper".to_string(),
            model: "claude-sonnet-4".to_string(),
            prompt: "Summarize r/rust".to_string(),
            temperature: 0.3,
            max_tokens: 1000,
        };

        let body = provider.build_request_body(&request);

        assert_eq!(body["model"], "claude-sonnet-4");
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Summarize r/rust");
    }

    #[test]
    fn test_usage_parsing() {
        let json = r#"{
            "content": [{"type": "text", "text": "done"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 120, "output_tokens": 48}
        }"#;
        let response: MessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.usage.input_tokens, 120);
        assert_eq!(response.usage.output_tokens, 48);
    }
}
