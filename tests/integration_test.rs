//! Integration tests for the Bedrock proxy server.
//!
//! These tests drive the full router against an in-process backend and verify:
//! - Authentication ordering
//! - Request validation and model resolution
//! - Non-streaming and streaming completions
//! - Model listing
//! - Request ids, health and metrics

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use bedrock_proxy::{
    api::{create_router, AppState, CredentialSet},
    core::{init_metrics, AppConfig, AppError, Result},
    services::backend::{
        Backend, BackendEventStream, BackendInvocation, BlockDelta, ConverseOutput,
        ConverseResponse, ConverseStreamEvent, FoundationModelSummary, InferenceProfileSummary,
        OutputMessage, TokenUsage,
    },
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

const MODEL: &str = "anthropic.claude-3-haiku-20240307-v1:0";
const BEARER: &str = "Bearer AKIAEXAMPLE@wJalrXUtnFEMI";

/// In-process backend that records what it was asked to do.
#[derive(Default)]
struct FakeBackend {
    calls: AtomicUsize,
    last_invocation: Mutex<Option<BackendInvocation>>,
    stream_error: Option<fn() -> AppError>,
}

impl FakeBackend {
    fn record(&self, invocation: &BackendInvocation) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_invocation.lock().unwrap() = Some(invocation.clone());
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn invoke(&self, _: &CredentialSet, invocation: &BackendInvocation) -> Result<ConverseResponse> {
        self.record(invocation);
        Ok(ConverseResponse {
            output: ConverseOutput {
                message: Some(OutputMessage {
                    role: "assistant".to_string(),
                    content: vec![json!({ "text": "Hello!" })],
                }),
            },
            stop_reason: Some("end_turn".to_string()),
            usage: Some(TokenUsage {
                input_tokens: Some(10),
                output_tokens: Some(5),
                total_tokens: Some(15),
                ..Default::default()
            }),
        })
    }

    async fn invoke_stream(
        &self,
        _: &CredentialSet,
        invocation: &BackendInvocation,
    ) -> Result<BackendEventStream> {
        self.record(invocation);
        if let Some(error) = self.stream_error {
            return Err(error());
        }
        let events = vec![
            Ok(ConverseStreamEvent::MessageStart {
                role: "assistant".to_string(),
            }),
            Ok(ConverseStreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Text("Hel".to_string()),
            }),
            Ok(ConverseStreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Text("lo".to_string()),
            }),
            Ok(ConverseStreamEvent::ContentBlockStop { index: 0 }),
            Ok(ConverseStreamEvent::MessageStop {
                stop_reason: Some("end_turn".to_string()),
            }),
            Ok(ConverseStreamEvent::Metadata {
                usage: Some(TokenUsage {
                    input_tokens: Some(3),
                    output_tokens: Some(2),
                    total_tokens: Some(5),
                    ..Default::default()
                }),
            }),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn list_foundation_models(&self, _: &CredentialSet) -> Result<Vec<FoundationModelSummary>> {
        Ok(vec![
            FoundationModelSummary {
                model_id: MODEL.to_string(),
                provider_name: Some("Anthropic".to_string()),
                output_modalities: vec!["TEXT".to_string()],
                inference_types_supported: vec!["ON_DEMAND".to_string()],
            },
            FoundationModelSummary {
                model_id: "amazon.titan-image-generator-v1".to_string(),
                provider_name: Some("Amazon".to_string()),
                output_modalities: vec!["IMAGE".to_string()],
                inference_types_supported: vec!["ON_DEMAND".to_string()],
            },
        ])
    }

    async fn list_inference_profiles(
        &self,
        _: &CredentialSet,
    ) -> Result<Vec<InferenceProfileSummary>> {
        Ok(vec![
            InferenceProfileSummary {
                inference_profile_id: format!("us.{}", MODEL),
                created_at: None,
                status: Some("ACTIVE".to_string()),
            },
            InferenceProfileSummary {
                inference_profile_id: MODEL.to_string(),
                created_at: None,
                status: Some("ACTIVE".to_string()),
            },
        ])
    }
}

/// Create a test application around the given backend
fn create_test_app(backend: Arc<FakeBackend>) -> Router {
    init_metrics();
    let state = Arc::new(AppState::new(AppConfig::default(), backend));
    create_router(state)
}

fn chat_request(body: Value, authorized: bool) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if authorized {
        builder = builder.header("authorization", BEARER);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

fn hello(model: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hi"}]
    })
}

#[tokio::test]
async fn test_missing_credentials_rejected_before_backend() {
    let backend = Arc::new(FakeBackend::default());
    let app = create_test_app(backend.clone());

    let response = app.oneshot(chat_request(hello(MODEL), false)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "unauthenticated");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_auth_checked_before_body_validation() {
    let backend = Arc::new(FakeBackend::default());
    let app = create_test_app(backend);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_body_rejected() {
    let app = create_test_app(Arc::new(FakeBackend::default()));

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", BEARER)
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "malformed_request");
}

#[tokio::test]
async fn test_empty_messages_rejected() {
    let backend = Arc::new(FakeBackend::default());
    let app = create_test_app(backend.clone());

    let response = app
        .oneshot(chat_request(json!({"model": MODEL, "messages": []}), true))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unresolvable_model_is_not_found() {
    let backend = Arc::new(FakeBackend::default());
    let app = create_test_app(backend.clone());

    let response = app
        .oneshot(chat_request(hello("invalid-model"), true))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "model_not_found");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_non_streaming_completion() {
    let backend = Arc::new(FakeBackend::default());
    let app = create_test_app(backend.clone());

    let response = app.oneshot(chat_request(hello(MODEL), true)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["object"], "chat.completion");
    assert_eq!(json["model"], MODEL);
    assert!(json["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(json["choices"][0]["message"]["role"], "assistant");
    assert_eq!(json["choices"][0]["message"]["content"], "Hello!");
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
    assert_eq!(json["usage"]["prompt_tokens"], 10);
    assert_eq!(json["usage"]["completion_tokens"], 5);
    assert_eq!(json["usage"]["total_tokens"], 15);

    let invocation = backend.last_invocation.lock().unwrap().clone().unwrap();
    assert_eq!(invocation.model_id, MODEL);
}

#[tokio::test]
async fn test_prefixed_model_routes_to_same_backend_id() {
    let backend = Arc::new(FakeBackend::default());
    let app = create_test_app(backend.clone());
    let prefixed = format!("bedrock/converse/{}", MODEL);

    let response = app
        .oneshot(chat_request(hello(&prefixed), true))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["model"], prefixed);
    let invocation = backend.last_invocation.lock().unwrap().clone().unwrap();
    assert_eq!(invocation.model_id, MODEL);
}

#[tokio::test]
async fn test_streaming_completion_ends_with_done() {
    let app = create_test_app(Arc::new(FakeBackend::default()));

    let mut body = hello(MODEL);
    body["stream"] = json!(true);
    body["stream_options"] = json!({"include_usage": true});
    let response = app.oneshot(chat_request(body, true)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let text = body_text(response).await;
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|f| !f.is_empty())
        .map(|f| f.strip_prefix("data: ").unwrap())
        .collect();

    assert_eq!(*frames.last().unwrap(), "[DONE]");

    let chunks: Vec<Value> = frames[..frames.len() - 1]
        .iter()
        .map(|f| serde_json::from_str(f).unwrap())
        .collect();
    let id = chunks[0]["id"].as_str().unwrap();
    assert!(chunks.iter().all(|c| c["id"] == id));
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));

    let content: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "Hello");

    assert!(chunks
        .iter()
        .any(|c| c["choices"][0]["finish_reason"] == "stop"));
    let usage = chunks.iter().find(|c| !c["usage"].is_null()).unwrap();
    assert_eq!(usage["usage"]["total_tokens"], 5);
}

#[tokio::test]
async fn test_streaming_open_failure_emits_error_event() {
    let backend = Arc::new(FakeBackend {
        stream_error: Some(|| AppError::BackendUnavailable("connection refused".to_string())),
        ..Default::default()
    });
    let app = create_test_app(backend);

    let mut body = hello(MODEL);
    body["stream"] = json!(true);
    let response = app.oneshot(chat_request(body, true)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();

    assert_eq!(frames.len(), 1);
    let error: Value = serde_json::from_str(frames[0].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(error["error"]["type"], "backend_unavailable");
    assert!(!text.contains("[DONE]"));
}

#[tokio::test]
async fn test_list_models_merges_and_dedups() {
    let app = create_test_app(Arc::new(FakeBackend::default()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .header("authorization", BEARER)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["object"], "list");

    let ids: Vec<&str> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    let expected_profile = format!("us.{}", MODEL);
    assert_eq!(ids, vec![MODEL, expected_profile.as_str()]);
    assert_eq!(json["data"][0]["owned_by"], "anthropic");
    assert_eq!(json["data"][0]["object"], "model");
}

#[tokio::test]
async fn test_list_models_requires_credentials() {
    let app = create_test_app(Arc::new(FakeBackend::default()));

    let response = app
        .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_request_id_echoed() {
    let app = create_test_app(Arc::new(FakeBackend::default()));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let generated = response.headers().get("x-request-id").unwrap();
    assert_eq!(generated.len(), 36);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "trace-abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-abc");
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app(Arc::new(FakeBackend::default()));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "healthy"}));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = create_test_app(Arc::new(FakeBackend::default()));

    let response = app
        .clone()
        .oneshot(chat_request(hello(MODEL), true))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    assert!(text.contains("bedrock_proxy_requests_total"));
}
