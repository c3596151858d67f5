use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ollie::agent::{collect_chat, OllamaClient, OllamaError, RetryPolicy};
use ollie::config::AgentConfig;
use ollie::types::Message;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        multiplier: 1.0,
    }
}

fn client(server: &MockServer) -> OllamaClient {
    let config = AgentConfig {
        base_url: server.uri(),
        model: "test-model".to_string(),
        ..AgentConfig::default()
    };
    OllamaClient::new(&config).with_retry_policy(fast_retry(3))
}

#[tokio::test]
async fn chat_returns_message_and_raw_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"model": "test-model", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "test-model",
            "message": {"role": "assistant", "content": "你好"},
            "done": true,
            "prompt_eval_count": 10,
            "eval_count": 5
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client(&server)
        .chat(&[Message::user("hi")], None)
        .await
        .unwrap();

    assert_eq!(response.message.content, "你好");
    assert!(response.done);
    assert_eq!(response.raw["prompt_eval_count"], 10);
}

#[tokio::test]
async fn chat_parses_tool_calls_without_ids() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "test-model",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "fs_read", "arguments": {"path": "a.txt"}}}]
            },
            "done": true
        })))
        .mount(&server)
        .await;

    let response = client(&server)
        .chat(&[Message::user("read a.txt")], None)
        .await
        .unwrap();

    let calls = response.message.tool_calls.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].function.name, "fs_read");
    assert_eq!(calls[0].function.arguments, json!({"path": "a.txt"}));
    assert!(calls[0].id.is_empty());
}

#[tokio::test]
async fn error_field_is_a_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"error": "model 'x' not found"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .chat(&[Message::user("hi")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, OllamaError::Server(ref msg) if msg.contains("not found")));
}

#[tokio::test]
async fn server_errors_are_retried_up_to_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server)
        .chat(&[Message::user("hi")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, OllamaError::Api { status: 500, .. }));
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .chat(&[Message::user("hi")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, OllamaError::Api { status: 400, ref body } if body == "bad request"));
}

#[tokio::test]
async fn retry_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "0.5.1"})))
        .mount(&server)
        .await;

    assert_eq!(client(&server).version().await.unwrap(), "0.5.1");
}

#[tokio::test]
async fn chat_stream_decodes_ndjson() {
    let server = MockServer::start().await;
    let body = [
        json!({"model": "test-model", "message": {"role": "assistant", "content": "Hel"}, "done": false}),
        json!({"model": "test-model", "message": {"role": "assistant", "content": "lo"}, "done": false}),
        json!({"model": "test-model", "message": {"role": "assistant", "content": ""}, "done": true, "eval_count": 2}),
    ]
    .iter()
    .map(|v| v.to_string())
    .collect::<Vec<_>>()
    .join("\n");

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let stream = client(&server)
        .chat_stream(&[Message::user("hi")], None)
        .await
        .unwrap();
    let mut deltas = Vec::new();
    let response = collect_chat(stream, |d| deltas.push(d.to_string()))
        .await
        .unwrap();

    assert_eq!(response.message.content, "Hello");
    assert_eq!(deltas, vec!["Hel", "lo"]);
    assert_eq!(response.raw["eval_count"], 2);
}

#[tokio::test]
async fn stream_error_line_ends_the_stream() {
    let server = MockServer::start().await;
    let body = "{\"response\":\"a\",\"done\":false}\n{\"error\":\"out of memory\"}\n";
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let mut stream = client(&server).generate_stream("hi", None).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap().response, "a");
    assert!(matches!(
        stream.next().await.unwrap(),
        Err(OllamaError::Server(_))
    ));
}

#[tokio::test]
async fn model_management_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "llama3:8b", "size": 4_700_000_000u64, "modified_at": "2024-05-01T00:00:00Z"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/delete"))
        .and(body_partial_json(json!({"model": "llama3:8b"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
        .mount(&server)
        .await;

    let client = client(&server);
    let models = client.list_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "llama3:8b");
    assert_eq!(client.pull_model("llama3:8b").await.unwrap().status, "success");
    client.delete_model("llama3:8b").await.unwrap();
}

#[tokio::test]
async fn embed_returns_vectors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({"input": ["hello"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2, 0.3]]
        })))
        .mount(&server)
        .await;

    let vectors = client(&server).embed(&["hello".to_string()]).await.unwrap();
    assert_eq!(vectors.len(), 1);
    assert_eq!(vectors[0].len(), 3);
}

#[tokio::test]
async fn generate_stream_yields_final_line_without_newline() {
    let server = MockServer::start().await;
    let body = concat!(
        "{\"model\":\"test-model\",\"response\":\"Once\",\"done\":false}\n",
        "{\"model\":\"test-model\",\"response\":\" upon\",\"done\":false}\n",
        "{\"model\":\"test-model\",\"response\":\"\",\"done\":true,\"eval_count\":2}"
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"prompt": "story", "stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .expect(1)
        .mount(&server)
        .await;

    let items: Vec<_> = client(&server)
        .generate_stream("story", None)
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 3);
    let chunks: Vec<_> = items.into_iter().map(Result::unwrap).collect();
    let text: String = chunks.iter().map(|c| c.response.as_str()).collect();
    assert_eq!(text, "Once upon");
    assert!(chunks[2].done);
    assert_eq!(chunks[2].raw["eval_count"], 2);
}
