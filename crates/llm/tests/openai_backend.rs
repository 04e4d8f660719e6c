//! Integration tests for the OpenAI-compatible backend.
//!
//! All tests use wiremock; no real model is called.

use std::sync::Arc;
use std::time::Duration;

use llm::{LlmConfig, OpenAiCompatibleBackend};
use pipeline::{
    BackendError, CancellationToken, FieldType, GenerationRequest, LlmBackend, ModelInvoker,
    PipelineError, RetryConfig, RetryPolicy, SchemaContract, Temperature,
};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend_for(server: &MockServer) -> OpenAiCompatibleBackend {
    let config = LlmConfig::new("test-key")
        .unwrap()
        .with_model("test-model")
        .unwrap()
        .with_base_url(&format!("{}/v1", server.uri()))
        .unwrap()
        .with_timeout(Duration::from_secs(5));
    OpenAiCompatibleBackend::new(config).unwrap()
}

fn chat_response(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
    })
}

fn draft_contract() -> SchemaContract {
    SchemaContract::builder("draft_code")
        .required("code", FieldType::String, "code")
        .required("explanation", FieldType::String, "explanation")
        .build()
        .unwrap()
}

fn request(timeout: Option<Duration>) -> GenerationRequest {
    GenerationRequest {
        prompt: "Write fib".to_string(),
        schema: draft_contract().descriptor(),
        temperature: Temperature::default(),
        timeout,
    }
}

// ─── Request shape ──────────────────────────────────────────────────────

#[tokio::test]
async fn sends_prompt_schema_and_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "messages": [{ "role": "user", "content": "Write fib" }],
            "temperature": 0.2,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "draft_code",
                    "strict": true,
                    "schema": {
                        "type": "object",
                        "required": ["code", "explanation"],
                        "additionalProperties": false
                    }
                }
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("{\"code\":\"x\"}")))
        .expect(1)
        .mount(&server)
        .await;

    let text = backend_for(&server).generate(&request(None)).await.unwrap();
    assert_eq!(text, "{\"code\":\"x\"}");
}

// ─── Error mapping ──────────────────────────────────────────────────────

#[tokio::test]
async fn unauthorized_is_not_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let err = backend_for(&server).generate(&request(None)).await.unwrap_err();
    assert_eq!(err.retry_policy(), RetryPolicy::NonRetryable);
    assert!(err.to_string().contains("401"));
    assert!(err.to_string().contains("invalid api key"));
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let err = backend_for(&server).generate(&request(None)).await.unwrap_err();
    assert_eq!(
        err.retry_policy(),
        RetryPolicy::Retryable {
            after: Some(Duration::from_secs(7))
        }
    );
}

#[tokio::test]
async fn server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = backend_for(&server).generate(&request(None)).await.unwrap_err();
    assert!(matches!(
        err,
        BackendError::Unavailable {
            retry: RetryPolicy::Retryable { after: None },
            ..
        }
    ));
}

#[tokio::test]
async fn empty_choices_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = backend_for(&server).generate(&request(None)).await.unwrap_err();
    assert!(matches!(err, BackendError::Protocol { .. }));
}

#[tokio::test]
async fn slow_response_times_out_with_request_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_response("{}"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let deadline = Duration::from_millis(100);
    let err = backend_for(&server)
        .generate(&request(Some(deadline)))
        .await
        .unwrap_err();
    assert_eq!(err, BackendError::Timeout { after: deadline });
}

#[tokio::test]
async fn unreachable_endpoint_is_retryable() {
    let config = LlmConfig::new("k")
        .unwrap()
        .with_base_url("http://127.0.0.1:1/v1")
        .unwrap();
    let backend = OpenAiCompatibleBackend::new(config).unwrap();

    let err = backend.generate(&request(Some(Duration::from_secs(2)))).await.unwrap_err();
    assert!(err.retry_policy().is_retryable());
}

// ─── Through the invoker ────────────────────────────────────────────────

#[tokio::test]
async fn fenced_reply_decodes_and_validates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(
            "```json\n{\"code\": \"def fib(n): ...\", \"explanation\": \"naive\"}\n```",
        )))
        .mount(&server)
        .await;

    let invoker = ModelInvoker::new(Arc::new(backend_for(&server)));
    let result = invoker.invoke("Write fib", &draft_contract()).await.unwrap();
    assert_eq!(result.get_str("explanation"), Some("naive"));
}

#[tokio::test]
async fn reply_missing_a_field_is_a_schema_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_response("{\"code\": \"x\"}")),
        )
        .mount(&server)
        .await;

    let invoker = ModelInvoker::new(Arc::new(backend_for(&server)));
    let err = invoker.invoke("Write fib", &draft_contract()).await.unwrap_err();
    let PipelineError::Schema(schema) = err else {
        panic!("expected schema error, got {err:?}");
    };
    assert_eq!(schema.missing_fields, vec!["explanation"]);
}

// ─── Full reflection run ────────────────────────────────────────────────

fn mount_stage(schema: &str, reply: Value) -> Mock {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": { "json_schema": { "name": schema } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(&reply.to_string())))
        .expect(1)
}

#[tokio::test]
async fn reflection_run_over_http_reaches_done() {
    let server = MockServer::start().await;
    mount_stage(
        "draft_code",
        json!({ "code": "def fib(n): ...", "explanation": "recursive" }),
    )
    .mount(&server)
    .await;
    mount_stage(
        "critique",
        json!({
            "has_errors": false,
            "is_efficient": false,
            "suggested_improvements": ["memoize"],
            "critique_summary": "exponential"
        }),
    )
    .mount(&server)
    .await;
    mount_stage(
        "refined_code",
        json!({ "refined_code": "@cache\ndef fib(n): ...", "refinement_summary": "memoized" }),
    )
    .mount(&server)
    .await;

    let invoker = Arc::new(ModelInvoker::new(Arc::new(backend_for(&server))));
    let runner = nodes::reflection_runner(invoker).unwrap();
    let state = runner
        .run("find the nth Fibonacci number", &CancellationToken::new())
        .await
        .unwrap();

    let record = nodes::ReflectionState::try_from(&state).unwrap();
    assert!(record.is_complete());
    assert_eq!(record.refined.unwrap().refinement_summary, "memoized");
}

#[tokio::test]
async fn transient_server_error_is_retried_when_enabled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_stage(
        "draft_code",
        json!({ "code": "def fib(n): ...", "explanation": "recursive" }),
    )
    .mount(&server)
    .await;

    let invoker = Arc::new(ModelInvoker::new(Arc::new(backend_for(&server))));
    let definitions = vec![nodes::generator::definition().unwrap()];
    let runner = pipeline::PipelineRunner::from_definitions(definitions, invoker)
        .unwrap()
        .with_retry(RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
        });

    let state = runner
        .run("fib", &CancellationToken::new())
        .await
        .unwrap();
    assert!(state.contains("draft"));
}
