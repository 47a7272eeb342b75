use async_trait::async_trait;
use axum::{body::Body, http::Request};
use bedrock_proxy::{
    api::{create_router, disconnect::DisconnectStream, AppState, CredentialSet},
    core::{cancel::StreamCancelHandle, init_metrics, AppConfig, AppError, Result},
    services::backend::{
        Backend, BackendEventStream, BackendInvocation, BlockDelta, ConverseResponse,
        ConverseStreamEvent, FoundationModelSummary, InferenceProfileSummary,
    },
};
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

/// Sets a flag when the backend stream is released.
struct DropGuard(Arc<AtomicBool>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Backend whose stream has ten text events and counts how many were read.
#[derive(Default)]
struct CountingBackend {
    pulls: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

#[async_trait]
impl Backend for CountingBackend {
    async fn invoke(&self, _: &CredentialSet, _: &BackendInvocation) -> Result<ConverseResponse> {
        Err(AppError::Internal("streaming only".to_string()))
    }

    async fn invoke_stream(
        &self,
        _: &CredentialSet,
        _: &BackendInvocation,
    ) -> Result<BackendEventStream> {
        let pulls = self.pulls.clone();
        let guard = DropGuard(self.released.clone());
        let events = futures::stream::unfold((0u32, guard), move |(i, guard)| {
            let pulls = pulls.clone();
            async move {
                if i >= 10 {
                    return None;
                }
                pulls.fetch_add(1, Ordering::SeqCst);
                let event = ConverseStreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: BlockDelta::Text(format!("token-{} ", i)),
                };
                Some((Ok(event), (i + 1, guard)))
            }
        });
        Ok(Box::pin(events))
    }

    async fn list_foundation_models(&self, _: &CredentialSet) -> Result<Vec<FoundationModelSummary>> {
        Ok(Vec::new())
    }

    async fn list_inference_profiles(
        &self,
        _: &CredentialSet,
    ) -> Result<Vec<InferenceProfileSummary>> {
        Ok(Vec::new())
    }
}

fn stream_request() -> Request<Body> {
    let body = json!({
        "model": "anthropic.claude-3-haiku-20240307-v1:0",
        "messages": [{"role": "user", "content": "Count to ten"}],
        "stream": true
    });
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", "Bearer AKIAEXAMPLE@secret")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_stream_cancel_handle() {
    let handle = StreamCancelHandle::new();
    let mut rx = handle.subscribe();

    assert!(!handle.is_cancelled());
    assert!(!*rx.borrow());

    assert!(handle.cancel());

    assert!(handle.is_cancelled());
    let _ = rx.changed().await;
    assert!(*rx.borrow());
}

#[tokio::test]
async fn test_completed_stream_is_not_a_disconnect() {
    let handle = StreamCancelHandle::new();
    handle.mark_completed();

    assert!(!handle.cancel());
    assert!(!handle.is_cancelled());
}

#[tokio::test]
async fn test_disconnect_stream_triggers_cancel_on_drop() {
    let handle = StreamCancelHandle::new();
    let rx = handle.subscribe();

    let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from("test"))]);

    {
        let _disconnect_stream = DisconnectStream {
            stream,
            cancel_handle: handle.clone(),
        };

        assert!(!handle.is_cancelled());
        assert!(!*rx.borrow());
    }

    assert!(handle.is_cancelled());
    assert!(*rx.borrow());
}

#[tokio::test]
async fn test_client_disconnect_stops_backend_reads() {
    init_metrics();
    let backend = Arc::new(CountingBackend::default());
    let state = Arc::new(AppState::new(AppConfig::default(), backend.clone()));
    let app = create_router(state);

    let response = app.oneshot(stream_request()).await.unwrap();
    assert_eq!(response.status(), 200);

    let mut body = response.into_body().into_data_stream();
    for i in 0..3 {
        let frame = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains(&format!("token-{}", i)), "frame {}: {}", i, text);
    }

    // Reads are demand-driven: three frames, three backend events.
    assert_eq!(backend.pulls.load(Ordering::SeqCst), 3);
    assert!(!backend.released.load(Ordering::SeqCst));

    drop(body);

    assert_eq!(backend.pulls.load(Ordering::SeqCst), 3);
    assert!(backend.released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_full_stream_reads_every_event() {
    init_metrics();
    let backend = Arc::new(CountingBackend::default());
    let state = Arc::new(AppState::new(AppConfig::default(), backend.clone()));
    let app = create_router(state);

    let response = app.oneshot(stream_request()).await.unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert_eq!(backend.pulls.load(Ordering::SeqCst), 10);
    assert!(text.ends_with("data: [DONE]\n\n"));
}
