//! HTTP request handlers for the Bedrock proxy API.
//!
//! This module contains the endpoint handlers for chat completions, model
//! listings, health checks and metrics, plus the router that mounts them.

use crate::api::auth::{authorization_header, resolver_for, CredentialResolver, CredentialSet};
use crate::api::models::{ChatCompletionRequest, ModelList};
use crate::api::streaming::{record_token_usage, stream_completion};
use crate::core::config::AppConfig;
use crate::core::metrics::get_metrics;
use crate::core::middleware::{request_id_middleware, MetricsMiddleware, ModelName};
use crate::core::{AppError, Result};
use crate::services::backend::{Backend, BackendInvocation, ConverseResponse};
use crate::services::ModelCatalog;
use crate::transformer::{translate_request, translate_response, StreamContext, Translation};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Maximum accepted request body; inline images make chat payloads large.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub resolver: Arc<dyn CredentialResolver>,
    pub backend: Arc<dyn Backend>,
    pub catalog: Arc<ModelCatalog>,
}

impl AppState {
    pub fn new(config: AppConfig, backend: Arc<dyn Backend>) -> Self {
        let resolver = resolver_for(&config.auth);
        let catalog = Arc::new(ModelCatalog::new(
            backend.clone(),
            Duration::from_secs(config.model_cache_ttl_secs),
            config.backend.region.clone(),
        ));
        Self {
            config: Arc::new(config),
            resolver,
            backend,
            catalog,
        }
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Vec<CredentialSet>> {
    let credentials = state.resolver.resolve_all(authorization_header(headers))?;
    if let Some(first) = credentials.first() {
        tracing::debug!(
            access_key = %first.masked_access_key(),
            source = first.source.as_str(),
            candidates = credentials.len(),
            "Resolved credentials"
        );
    }
    Ok(credentials)
}

fn parse_request(body: &[u8]) -> Result<ChatCompletionRequest> {
    serde_json::from_slice(body)
        .map_err(|e| AppError::MalformedRequest(format!("Invalid request body: {}", e)))
}

fn log_warnings(translation: &Translation) {
    if translation.warnings.is_empty() {
        return;
    }
    let metrics = get_metrics();
    for warning in &translation.warnings {
        tracing::warn!(
            model = %translation.routed_model,
            parameter = %warning.parameter,
            "Parameter not forwarded: {}",
            warning.reason
        );
        metrics
            .dropped_params
            .with_label_values(&[&warning.parameter])
            .inc();
    }
}

/// Call the backend, moving to the next credential set on backend failures.
async fn invoke_with_failover(
    backend: &dyn Backend,
    credentials: &[CredentialSet],
    invocation: &BackendInvocation,
) -> Result<ConverseResponse> {
    let mut last_error = None;
    for (attempt, creds) in credentials.iter().enumerate() {
        match backend.invoke(creds, invocation).await {
            Ok(response) => return Ok(response),
            Err(e) if e.kind().allows_failover() && attempt + 1 < credentials.len() => {
                tracing::warn!(
                    access_key = %creds.masked_access_key(),
                    error = %e,
                    "Backend call failed, trying next credentials"
                );
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error
        .unwrap_or_else(|| AppError::Unauthenticated("No credentials available".to_string())))
}

/// Handle chat completion requests.
///
/// Credentials are resolved before the body is parsed, so an unauthenticated
/// caller never reaches validation or the backend.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let credentials = authenticate(&state, &headers)?;
    let request = parse_request(&body)?;
    let translation = translate_request(&request, &state.config.model_prefix)?;
    log_warnings(&translation);

    tracing::info!(
        model = %translation.routed_model,
        backend_model = %translation.invocation.model_id,
        family = %translation.invocation.family,
        stream = request.is_stream(),
        messages = request.messages.len(),
        "Chat completion request"
    );

    let model_name = ModelName(translation.routed_model.clone());

    let mut response = if request.is_stream() {
        let ctx = StreamContext::new(request.model.clone(), request.include_usage());
        stream_completion(
            state.backend.as_ref(),
            &credentials,
            &translation.invocation,
            ctx,
        )
        .await?
    } else {
        let output =
            invoke_with_failover(state.backend.as_ref(), &credentials, &translation.invocation)
                .await?;
        let completion = translate_response(&output, &request.model);
        if let Some(usage) = &completion.usage {
            record_token_usage(usage, &translation.routed_model);
        }
        Json(completion).into_response()
    };

    response.extensions_mut().insert(model_name);
    Ok(response)
}

/// List the models callable with the caller's credentials.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ModelList>> {
    let credentials = authenticate(&state, &headers)?;
    let models = state.catalog.list_models(&credentials).await;
    tracing::debug!(count = models.len(), "Listing available models");
    Ok(Json(ModelList::new(models)))
}

/// Liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler() -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(buffer.into())
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Build the application router with all routes and middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/v1/models", get(list_models))
        .route("/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/chat/completions", post(chat_completions))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(MetricsMiddleware::track_metrics))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
