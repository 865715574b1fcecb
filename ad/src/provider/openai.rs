//! OpenAI-compatible chat completions provider

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{InvocationOutput, InvocationRequest, Provider, ProviderError, api_key_from_env, cost_from_usage,
            retry_after_from_header};
use crate::config::ProviderConfig;

/// OpenAI chat completions client
pub struct OpenAiProvider {
    name: String,
    api_key: String,
    base_url: String,
    http: Client,
    config: ProviderConfig,
}

impl OpenAiProvider {
    /// Create a new client from configuration
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
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationOutput, ProviderError> {
        debug!(agent = %request.agent, model = %request.model, "invoke: called");
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_request_body(request);

        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
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

        let api_response: CompletionsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let input_tokens = api_response.usage.prompt_tokens as i64;
        let output_tokens = api_response.usage.completion_tokens as i64;

        debug!(agent = %request.agent, input_tokens, output_tokens, "invoke: success");
        Ok(InvocationOutput {
            items_processed: 1,
            items_failed: 0,
            tokens_used: input_tokens + output_tokens,
            cost_usd: cost_from_usage(&self.config, input_tokens, output_tokens),
        })
    }
}

// OpenAI API response types

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    usage: CompletionsUsage,
}

#[derive(Debug, Deserialize)]
struct CompletionsUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_body() {
        let provider = OpenAiProvider {
            name: "openai".to_string(),
            api_key: "test-key".to_string(),
            base_url: "https://api.openai.com".to_string(),
            http: Client::new(),
            config: ProviderConfig::default(),
        };
        let request = InvocationRequest {
            agent: "digest".to_string(),
            model: "gpt-4o-mini".to_string(),
            prompt: "Daily digest".to_string(),
            temperature: 0.7,
            max_tokens: 512,
        };

        let body = provider.build_request_body(&request);

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["content"], "Daily digest");
    }

    #[test]
    fn test_usage_parsing() {
        let json = r#"{
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
            "usage": {"prompt_tokens": 80, "completion_tokens": 20, "total_tokens": 100}
        }"#;
        let response: CompletionsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.usage.prompt_tokens, 80);
        assert_eq!(response.usage.completion_tokens, 20);
    }
}
