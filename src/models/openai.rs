//! OpenAI chat-completions provider, plus the image-generation capability.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    parse_token_usage, parse_tool_calls, serialize_messages, ChatMessage, ImageGenerator,
    ModelProvider, ProviderResponse, TokenUsage,
};

/// Default endpoint for OpenAI chat completions.
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Provider that talks to the OpenAI-compatible chat completions API.
pub struct OpenAIProvider {
    api_key: String,
    endpoint: String,
    client: Client,
    /// Model name sent in the request body (e.g. "gpt-4o-mini").
    model: String,
}

impl OpenAIProvider {
    /// Create a provider against the default endpoint.
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_config(api_key, DEFAULT_ENDPOINT.to_string(), model)
    }

    /// Create a provider with explicit configuration (useful for tests or
    /// non-default endpoints).
    pub fn with_config(api_key: String, endpoint: String, model: String) -> Self {
        Self {
            api_key,
            endpoint,
            client: Client::builder()
                .timeout(Duration::from_secs(90))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            model,
        }
    }

    /// Endpoint for a sibling API route, derived from the chat endpoint so
    /// a single override redirects everything (proxies, tests).
    fn sibling_endpoint(&self, route: &str) -> String {
        self.endpoint.replace("/chat/completions", route)
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    /// Send chat messages with an array of tool definitions.
    ///
    /// Returns [`ProviderResponse::ToolCalls`] when the model wants to
    /// invoke functions, or [`ProviderResponse::Final`] for a normal reply.
    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> anyhow::Result<(ProviderResponse, Option<TokenUsage>)> {
        let api_messages = serialize_messages(messages);

        let mut body = json!({
            "model": self.model,
            "messages": api_messages,
        });

        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
            body["tool_choice"] = json!("auto");
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API returned {status}: {text}");
        }

        let json: Value = resp.json().await?;
        let usage = parse_token_usage(&json);

        if let Some(pr) = parse_tool_calls(&json) {
            return Ok((pr, usage));
        }

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        Ok((ProviderResponse::Final(content), usage))
    }
}

#[async_trait]
impl ImageGenerator for OpenAIProvider {
    /// Generate an image with the images endpoint and return its URL.
    async fn generate_image(&self, prompt: &str) -> anyhow::Result<String> {
        let url = self.sibling_endpoint("/images/generations");
        let body = json!({
            "model": "dall-e-3",
            "prompt": prompt,
            "size": "1024x1024",
            "quality": "standard",
            "n": 1,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI Images API returned {status}: {text}");
        }

        let json: Value = resp.json().await?;
        json["data"][0]["url"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| anyhow::anyhow!("images response contained no url"))
    }
}
