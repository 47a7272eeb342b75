//! HTTP middleware for request ids and metrics.

use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Extension type for storing the requested model name in the response.
#[derive(Clone, Debug)]
pub struct ModelName(pub String);

/// Assign a request id, scope it for logging, and echo it in `X-Request-ID`.
///
/// An inbound `X-Request-ID` is reused so ids can be correlated across hops.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id);

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    tracing::info!(request_id = %request_id, "Request started: {} {}", method, path);

    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;

    tracing::info!(
        request_id = %request_id,
        status = response.status().as_u16(),
        "Request completed in {:.3}s",
        start.elapsed().as_secs_f64()
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    response
}

/// Middleware for tracking request metrics.
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Track metrics for incoming requests.
    ///
    /// Increments the active request gauge, measures duration and records the
    /// request count by status code. For streaming responses the measured
    /// duration is time to first byte, since `next.run()` returns once headers
    /// are ready.
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let endpoint = request.uri().path().to_string();
        let method = request.method().to_string();

        // Skip metrics endpoint itself to avoid recursion
        if endpoint == "/metrics" {
            return next.run(request).await;
        }

        let metrics = get_metrics();
        metrics
            .active_requests
            .with_label_values(&[&endpoint])
            .inc();

        let start = Instant::now();
        let response = next.run(request).await;
        let duration = start.elapsed().as_secs_f64();
        let status_code = response.status().as_u16().to_string();

        let model = response
            .extensions()
            .get::<ModelName>()
            .map(|m| m.0.as_str())
            .unwrap_or("none");

        metrics
            .request_count
            .with_label_values(&[&method, &endpoint, model, &status_code])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[&method, &endpoint, model])
            .observe(duration);

        let is_streaming = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);

        if is_streaming {
            tracing::info!(
                "{} {} - status={} model={} ttfb={:.3}s",
                method,
                endpoint,
                status_code,
                model,
                duration
            );
        } else {
            tracing::info!(
                "{} {} - status={} model={} duration={:.3}s",
                method,
                endpoint,
                status_code,
                model,
                duration
            );
        }

        metrics
            .active_requests
            .with_label_values(&[&endpoint])
            .dec();

        response
    }
}
