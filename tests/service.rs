use std::sync::Arc;

use doc_harness::config::{LlmConfig, RetryConfig};
use doc_harness::error::LlmError;
use doc_harness::llm::{ChatMessage, LlmClient, LlmSettings, OpenAiGenerator, RetryPolicy};
use doc_harness::response_cache::ResponseCache;
use doc_harness::tokenizer::ByteTokenizer;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion(text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }]
    })
}

fn client(server: &MockServer, max_attempts: u32) -> LlmClient {
    let generator = OpenAiGenerator::new(&server.uri(), "sk-test".to_string()).unwrap();
    let retry = RetryPolicy::from_config(&RetryConfig {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 2,
        ..RetryConfig::default()
    });
    LlmClient::new(
        Arc::new(generator),
        Arc::new(ByteTokenizer),
        LlmSettings::from_config(&LlmConfig::default()),
        retry,
    )
}

fn messages() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("Describe the file."),
        ChatMessage::user("fn main() {}"),
    ]
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap().len()
}

#[tokio::test]
async fn test_success_sends_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Entry point.")))
        .mount(&server)
        .await;

    let text = client(&server, 3).chat(messages()).await.unwrap();
    assert_eq!(text, "Entry point.");

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "fn main() {}");
}

#[tokio::test]
async fn test_persistent_503_exhausts_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let llm = client(&server, 4);
    let err = llm.chat(messages()).await.unwrap_err();
    match err {
        LlmError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(matches!(*last, LlmError::Server { status: 503, .. }));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(request_count(&server).await, 4);
    assert_eq!(llm.remote_calls(), 4);
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Recovered.")))
        .mount(&server)
        .await;

    let text = client(&server, 5).chat(messages()).await.unwrap();
    assert_eq!(text, "Recovered.");
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let err = client(&server, 5).chat(messages()).await.unwrap_err();
    assert!(matches!(err, LlmError::Rejected { status: 400, .. }));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn test_malformed_and_empty_responses_fail_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("  \n")))
        .mount(&server)
        .await;

    let llm = client(&server, 5);
    let err = llm.chat(messages()).await.unwrap_err();
    assert!(matches!(err, LlmError::Malformed(_)));
    let err = llm.chat(messages()).await.unwrap_err();
    assert!(matches!(err, LlmError::EmptyResponse));
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn test_cached_response_skips_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Once.")))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ResponseCache::open(dir.path()));
    let llm = client(&server, 3).with_cache(cache.clone());
    assert_eq!(llm.chat(messages()).await.unwrap(), "Once.");
    assert_eq!(llm.chat(messages()).await.unwrap(), "Once.");
    assert_eq!(request_count(&server).await, 1);
    cache.save().unwrap();

    let reopened = Arc::new(ResponseCache::open(dir.path()));
    let llm = client(&server, 3).with_cache(reopened);
    assert_eq!(llm.chat(messages()).await.unwrap(), "Once.");
    assert_eq!(llm.remote_calls(), 0);
    assert_eq!(request_count(&server).await, 1);
}
