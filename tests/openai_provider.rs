//! HTTP-level tests for the OpenAI provider using a wiremock server.

use chime::models::{self, ChatMessage, ModelProvider, OpenAIProvider, ProviderResponse};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider_for(server: &MockServer) -> OpenAIProvider {
    OpenAIProvider::with_config(
        "sk-test".into(),
        format!("{}/v1/chat/completions", server.uri()),
        "gpt-4o-mini".into(),
    )
}

fn sample_messages() -> Vec<ChatMessage> {
    vec![
        ChatMessage::new("system", "You are a helpful assistant."),
        ChatMessage::new("user", "set a timer for 5 minutes called tea"),
    ]
}

#[tokio::test]
async fn tool_call_response_is_parsed_with_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {
                            "name": "create_timer",
                            "arguments": "{\"name\":\"tea\",\"time\":5,\"description\":\"\"}"
                        }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 42, "completion_tokens": 7, "total_tokens": 49 }
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let (response, usage) = provider
        .send_chat_with_functions(&sample_messages(), &chime::tools::function_defs())
        .await
        .unwrap();

    match response {
        ProviderResponse::ToolCalls(items) => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].id, "call_9");
            assert_eq!(items[0].name, "create_timer");
            assert!(items[0].arguments.contains("tea"));
        }
        other => panic!("expected tool calls, got {other:?}"),
    }
    assert_eq!(usage.unwrap().total_tokens, 49);

    // The request carried the tool schema and the serialized messages.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["tool_choice"], "auto");
    assert!(body["tools"].as_array().is_some_and(|t| !t.is_empty()));
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["role"], "user");
}

#[tokio::test]
async fn empty_tool_slice_omits_schema_and_yields_final_text() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "role": "assistant", "content": "Your timer is set." }
            }],
            "usage": { "prompt_tokens": 50, "completion_tokens": 6, "total_tokens": 56 }
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let (response, _usage) = provider
        .send_chat_with_functions(&sample_messages(), &[])
        .await
        .unwrap();

    match response {
        ProviderResponse::Final(text) => assert_eq!(text, "Your timer is set."),
        other => panic!("expected final text, got {other:?}"),
    }

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body.get("tools").is_none());
    assert!(body.get("tool_choice").is_none());
}

#[tokio::test]
async fn retry_recovers_from_transient_500() {
    let server = MockServer::start().await;

    // First request fails, second succeeds.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "recovered" } }]
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let (response, _usage) = models::send_with_retry(&provider, &sample_messages(), &[], 3)
        .await
        .unwrap();

    match response {
        ProviderResponse::Final(text) => assert_eq!(text, "recovered"),
        other => panic!("expected final text, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn permanent_401_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let err = models::send_with_retry(&provider, &sample_messages(), &[], 3)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("401"));

    // Only one request despite three allowed attempts.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
