//! Streaming response coordinator.
//!
//! One coordinator drives one streaming completion:
//!
//! ```text
//! Idle ─▶ StreamOpening ─▶ StreamActive ─▶ StreamClosing ─▶ Closed
//!              │                 │
//!              └──────▶ Errored ◀┘
//! ```
//!
//! Frames are produced on demand: the next backend event is read only when
//! the outbound body asks for the next frame, so at most one chunk is in
//! flight. Every session ends with `data: [DONE]` or exactly one error event.

use crate::api::auth::CredentialSet;
use crate::api::disconnect::DisconnectStream;
use crate::api::models::Usage;
use crate::core::error::Result;
use crate::core::logging::get_request_id;
use crate::core::metrics::get_metrics;
use crate::core::{AppError, StreamCancelHandle, StreamOutcome};
use crate::services::backend::{Backend, BackendEventStream, BackendInvocation};
use crate::transformer::{translate_chunk, StreamContext};
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::watch;

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    StreamOpening,
    StreamActive,
    StreamClosing,
    Closed,
    Errored,
}

pub struct StreamCoordinator {
    state: StreamState,
    events: Option<BackendEventStream>,
    /// Error waiting to be emitted as the terminal event
    pending_error: Option<AppError>,
    ctx: StreamContext,
    cancel: StreamCancelHandle,
    cancel_rx: watch::Receiver<bool>,
    /// Captured at construction; the body is polled outside the request scope
    request_id: String,
    started: Instant,
    chunks_sent: usize,
}

impl StreamCoordinator {
    pub fn new(ctx: StreamContext, cancel: StreamCancelHandle) -> Self {
        let cancel_rx = cancel.subscribe();
        Self {
            state: StreamState::Idle,
            events: None,
            pending_error: None,
            ctx,
            cancel,
            cancel_rx,
            request_id: get_request_id(),
            started: Instant::now(),
            chunks_sent: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Open the backend stream, failing over across credential sets.
    pub async fn open(
        &mut self,
        backend: &dyn Backend,
        credentials: &[CredentialSet],
        invocation: &BackendInvocation,
    ) {
        if self.state != StreamState::Idle {
            return;
        }
        self.state = StreamState::StreamOpening;

        let mut last_error = None;
        for (attempt, creds) in credentials.iter().enumerate() {
            match backend.invoke_stream(creds, invocation).await {
                Ok(events) => {
                    tracing::debug!(
                        model = %invocation.model_id,
                        access_key = %creds.masked_access_key(),
                        "Backend stream opened"
                    );
                    self.events = Some(events);
                    self.state = StreamState::StreamActive;
                    return;
                }
                Err(e) if e.kind().allows_failover() && attempt + 1 < credentials.len() => {
                    tracing::warn!(
                        access_key = %creds.masked_access_key(),
                        error = %e,
                        "Stream open failed, trying next credentials"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        self.fail(last_error.unwrap_or_else(|| {
            AppError::Unauthenticated("No credentials available".to_string())
        }));
    }

    fn fail(&mut self, error: AppError) {
        self.events = None;
        self.pending_error = Some(error);
        self.state = StreamState::Errored;
    }

    /// Produce the next SSE frame, or `None` once the session is over.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.cancel.is_cancelled() && self.state == StreamState::StreamActive {
                self.close_on_disconnect();
                return None;
            }

            match self.state {
                StreamState::Idle | StreamState::StreamOpening => {
                    self.fail(AppError::Internal(
                        "stream polled before the backend stream was opened".to_string(),
                    ));
                }
                StreamState::StreamActive => {
                    let Some(events) = self.events.as_mut() else {
                        self.fail(AppError::Internal("active stream has no backend".to_string()));
                        continue;
                    };

                    let pulled = tokio::select! {
                        biased;
                        _ = cancelled(&mut self.cancel_rx) => None,
                        next = events.next() => Some(next),
                    };
                    let Some(next) = pulled else {
                        self.close_on_disconnect();
                        return None;
                    };

                    match next {
                        Some(Ok(event)) => {
                            let Some(chunk) = translate_chunk(event, &mut self.ctx) else {
                                continue;
                            };
                            match serde_json::to_string(&chunk) {
                                Ok(json) => {
                                    self.chunks_sent += 1;
                                    return Some(Bytes::from(format!("data: {}\n\n", json)));
                                }
                                Err(e) => self.fail(e.into()),
                            }
                        }
                        Some(Err(e)) => self.fail(e),
                        None => {
                            self.events = None;
                            self.state = StreamState::StreamClosing;
                        }
                    }
                }
                StreamState::StreamClosing => {
                    self.state = StreamState::Closed;
                    self.finish(StreamOutcome::Completed);
                    return Some(Bytes::from_static(DONE_FRAME.as_bytes()));
                }
                StreamState::Errored => {
                    let error = self.pending_error.take()?;
                    tracing::warn!(
                        request_id = %self.request_id,
                        error_type = %error.kind(),
                        chunks_sent = self.chunks_sent,
                        "Stream terminated with error: {}",
                        error
                    );
                    self.finish(StreamOutcome::Errored);
                    return Some(Bytes::from(format!("data: {}\n\n", error.to_error_body())));
                }
                StreamState::Closed => return None,
            }
        }
    }

    fn close_on_disconnect(&mut self) {
        self.events = None;
        self.state = StreamState::Closed;
        tracing::debug!(
            request_id = %self.request_id,
            chunks_sent = self.chunks_sent,
            "Stream closed by client"
        );
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        self.cancel.mark_completed();

        let metrics = get_metrics();
        metrics
            .stream_outcomes
            .with_label_values(&[outcome.as_str()])
            .inc();
        if let Some(usage) = self.ctx.usage() {
            record_token_usage(usage, &self.ctx.model);
        }

        tracing::info!(
            request_id = %self.request_id,
            model = %self.ctx.model,
            outcome = %outcome,
            chunks = self.chunks_sent,
            finish_reason = self.ctx.finish_reason().unwrap_or("none"),
            "Stream finished in {:.3}s",
            self.started.elapsed().as_secs_f64()
        );
    }

    /// The session as a lazy, finite, non-restartable sequence of SSE frames.
    pub fn into_frames(self) -> impl Stream<Item = Bytes> + Send {
        futures::stream::unfold(self, |mut coordinator| async move {
            let frame = coordinator.next_frame().await?;
            Some((frame, coordinator))
        })
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

pub fn record_token_usage(usage: &Usage, model: &str) {
    let metrics = get_metrics();
    for (token_type, count) in [
        ("prompt", usage.prompt_tokens),
        ("completion", usage.completion_tokens),
        ("total", usage.total_tokens),
    ] {
        if let Some(count) = count {
            metrics
                .token_usage
                .with_label_values(&[model, token_type])
                .inc_by(u64::from(count));
        }
    }
}

/// Open a streaming completion and wrap it in an SSE response.
pub async fn stream_completion(
    backend: &dyn Backend,
    credentials: &[CredentialSet],
    invocation: &BackendInvocation,
    ctx: StreamContext,
) -> Result<Response> {
    let cancel = StreamCancelHandle::new();
    let mut coordinator = StreamCoordinator::new(ctx, cancel.clone());
    coordinator.open(backend, credentials, invocation).await;

    let frames = coordinator.into_frames().map(Ok::<Bytes, Infallible>);
    let body = DisconnectStream {
        stream: Box::pin(frames),
        cancel_handle: cancel,
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body))
        .map_err(|e| AppError::Internal(format!("Failed to build stream response: {}", e)))
}
