//! Model provider abstractions.
//!
//! Defines the [`ModelProvider`] trait, the [`ChatMessage`] wire type,
//! response parsing helpers, and the retry wrapper used by the
//! conversation engine.

pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

pub use openai::OpenAIProvider;

// ---------------------------------------------------------------------------
// ChatMessage – shared message representation
// ---------------------------------------------------------------------------

/// A single chat message with a role and content.
///
/// Carries tool-calling metadata so that `tool` role messages and
/// assistant `tool_calls` responses are serialised correctly for the API.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// For assistant messages that invoke tools: the raw wire-format
    /// `tool_calls` array.
    pub tool_calls: Option<Vec<Value>>,
    /// For `role: "tool"` messages: the id of the tool call this result
    /// corresponds to.
    pub tool_call_id: Option<String>,
    /// For `role: "tool"` messages: the invoked function name.
    pub name: Option<String>,
}

impl ChatMessage {
    /// Convenience constructor for a plain message (no tool metadata).
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

/// Serialise a slice of [`ChatMessage`]s into the OpenAI-compatible JSON
/// array format, including `tool_calls`, `tool_call_id`, and `name` when
/// present.
pub fn serialize_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = serde_json::json!({ "role": m.role });
            if let Some(ref tcs) = m.tool_calls {
                msg["tool_calls"] = serde_json::json!(tcs);
                // The API expects content to be null on assistant messages
                // that carry tool_calls.
                if m.content.is_empty() {
                    msg["content"] = Value::Null;
                } else {
                    msg["content"] = serde_json::json!(m.content);
                }
            } else {
                msg["content"] = serde_json::json!(m.content);
            }
            if let Some(ref tcid) = m.tool_call_id {
                msg["tool_call_id"] = serde_json::json!(tcid);
            }
            if let Some(ref name) = m.name {
                msg["name"] = serde_json::json!(name);
            }
            msg
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Token usage statistics returned by the API.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A single function call requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCallItem {
    /// Tool-call id assigned by the API.
    pub id: String,
    pub name: String,
    /// Raw JSON-encoded argument object.
    pub arguments: String,
}

/// Response from a model call: a final text reply or tool invocations.
#[derive(Debug, Clone)]
pub enum ProviderResponse {
    /// Plain text reply from the model.
    Final(String),
    /// The model wants to invoke one or more functions.
    ToolCalls(Vec<ToolCallItem>),
}

/// Extract token usage statistics from a chat-completion response JSON.
pub fn parse_token_usage(json: &Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    })
}

/// Parse `tool_calls` from a chat-completion response.
///
/// Returns `Some(ProviderResponse::ToolCalls(..))` when the response
/// requests at least one function, `None` otherwise.
pub fn parse_tool_calls(json: &Value) -> Option<ProviderResponse> {
    let message = json.get("choices")?.get(0)?.get("message")?;
    let tool_calls = message.get("tool_calls").and_then(|v| v.as_array())?;

    let items: Vec<ToolCallItem> = tool_calls
        .iter()
        .filter_map(|tc| {
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let arguments = func
                .get("arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("{}")
                .to_string();
            let id = tc
                .get("id")
                .and_then(|i| i.as_str())
                .unwrap_or("")
                .to_string();
            Some(ToolCallItem { id, name, arguments })
        })
        .collect();

    if items.is_empty() {
        None
    } else {
        Some(ProviderResponse::ToolCalls(items))
    }
}

// ---------------------------------------------------------------------------
// ModelProvider trait
// ---------------------------------------------------------------------------

/// Trait implemented by every LLM backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send the conversation with an array of function/tool definitions.
    ///
    /// An empty `tools` slice must omit the tool schema from the request
    /// entirely — that is how the engine forces a plain-text final answer
    /// after a tool loop.
    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> anyhow::Result<(ProviderResponse, Option<TokenUsage>)>;
}

/// Trait for the image-generation capability, reachable only through the
/// tool dispatcher.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate an image for the prompt and return its URL.
    async fn generate_image(&self, prompt: &str) -> anyhow::Result<String>;
}

// ---------------------------------------------------------------------------
// Retry wrapper
// ---------------------------------------------------------------------------

/// Call the provider with up to `max_attempts` attempts and exponential
/// backoff (100 ms × 2^attempt).
///
/// Permanent errors (auth failures, bad requests, not-found) skip the
/// remaining retries and surface immediately.
pub async fn send_with_retry(
    provider: &dyn ModelProvider,
    messages: &[ChatMessage],
    tools: &[Value],
    max_attempts: usize,
) -> anyhow::Result<(ProviderResponse, Option<TokenUsage>)> {
    let attempts = max_attempts.max(1);
    let mut last_err = anyhow::anyhow!("no attempts made");

    for attempt in 0..attempts {
        match provider.send_chat_with_functions(messages, tools).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let permanent = is_permanent_error(&e);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    permanent,
                    error = %e,
                    "model call failed"
                );
                last_err = e;
                if permanent {
                    break;
                }
                if attempt + 1 < attempts {
                    let delay = Duration::from_millis(100 * 2u64.pow(attempt as u32));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(last_err)
}

/// Check if an error represents a permanent HTTP failure that should not
/// be retried.
///
/// Parses status codes from error messages like "OpenAI API returned 401: …"
fn is_permanent_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    ["400", "401", "403", "404", "422"]
        .iter()
        .any(|code| msg.contains(&format!("returned {code}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_plain_message() {
        let msgs = vec![ChatMessage::new("user", "hello")];
        let out = serialize_messages(&msgs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["role"], "user");
        assert_eq!(out[0]["content"], "hello");
        assert!(out[0].get("tool_calls").is_none());
    }

    #[test]
    fn serialize_assistant_tool_calls_nulls_content() {
        let msgs = vec![ChatMessage {
            role: "assistant".into(),
            content: String::new(),
            tool_calls: Some(vec![json!({
                "id": "call_1",
                "type": "function",
                "function": { "name": "create_timer", "arguments": "{}" }
            })]),
            tool_call_id: None,
            name: None,
        }];
        let out = serialize_messages(&msgs);
        assert!(out[0]["content"].is_null());
        assert_eq!(out[0]["tool_calls"][0]["id"], "call_1");
    }

    #[test]
    fn serialize_tool_result_carries_id_and_name() {
        let msgs = vec![ChatMessage {
            role: "tool".into(),
            content: "done".into(),
            tool_calls: None,
            tool_call_id: Some("call_1".into()),
            name: Some("create_timer".into()),
        }];
        let out = serialize_messages(&msgs);
        assert_eq!(out[0]["tool_call_id"], "call_1");
        assert_eq!(out[0]["name"], "create_timer");
    }

    #[test]
    fn parse_tool_calls_modern_format() {
        let resp = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {
                            "name": "create_timer",
                            "arguments": "{\"name\":\"tea\",\"time\":5}"
                        }
                    }]
                }
            }]
        });
        match parse_tool_calls(&resp) {
            Some(ProviderResponse::ToolCalls(items)) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].id, "call_abc");
                assert_eq!(items[0].name, "create_timer");
                assert!(items[0].arguments.contains("tea"));
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn parse_tool_calls_absent_returns_none() {
        let resp = json!({
            "choices": [{ "message": { "role": "assistant", "content": "hi" } }]
        });
        assert!(parse_tool_calls(&resp).is_none());
    }

    #[test]
    fn parse_usage() {
        let resp = json!({
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        });
        let usage = parse_token_usage(&resp).unwrap();
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.prompt_tokens, 10);
    }

    #[test]
    fn permanent_error_detection() {
        assert!(is_permanent_error(&anyhow::anyhow!(
            "OpenAI API returned 401 Unauthorized: bad key"
        )));
        assert!(!is_permanent_error(&anyhow::anyhow!(
            "OpenAI API returned 500 Internal Server Error: oops"
        )));
        assert!(!is_permanent_error(&anyhow::anyhow!("connection refused")));
    }
}
