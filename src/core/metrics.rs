//! Prometheus metrics for monitoring the Bedrock proxy.
//!
//! This module provides a centralized metrics registry for tracking requests,
//! latency, token usage, streaming outcomes and backend health.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by method, endpoint, model and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by endpoint
    pub active_requests: GaugeVec,

    /// Total token usage by model and token type
    pub token_usage: IntCounterVec,

    /// Backend call latency by operation (converse, converse_stream, list_*)
    pub backend_latency: HistogramVec,

    /// Streaming sessions by terminal outcome
    pub stream_outcomes: IntCounterVec,

    /// Request parameters dropped during translation
    pub dropped_params: IntCounterVec,

    /// Model catalog listing failures by source
    pub catalog_failures: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "bedrock_proxy_requests_total",
            "Total number of requests",
            &["method", "endpoint", "model", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "bedrock_proxy_request_duration_seconds",
            "Request duration in seconds",
            &["method", "endpoint", "model"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "bedrock_proxy_active_requests",
            "Number of active requests",
            &["endpoint"]
        )
        .expect("Failed to register active_requests metric");

        let token_usage = register_int_counter_vec!(
            "bedrock_proxy_tokens_total",
            "Total number of tokens used",
            &["model", "token_type"]
        )
        .expect("Failed to register token_usage metric");

        let backend_latency = register_histogram_vec!(
            "bedrock_proxy_backend_latency_seconds",
            "Backend call latency in seconds",
            &["operation"],
            vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
        )
        .expect("Failed to register backend_latency metric");

        let stream_outcomes = register_int_counter_vec!(
            "bedrock_proxy_stream_outcomes_total",
            "Streaming sessions by terminal outcome",
            &["outcome"]
        )
        .expect("Failed to register stream_outcomes metric");

        let dropped_params = register_int_counter_vec!(
            "bedrock_proxy_dropped_params_total",
            "Request parameters dropped during translation",
            &["parameter"]
        )
        .expect("Failed to register dropped_params metric");

        let catalog_failures = register_int_counter_vec!(
            "bedrock_proxy_catalog_failures_total",
            "Model catalog listing failures",
            &["source"]
        )
        .expect("Failed to register catalog_failures metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            token_usage,
            backend_latency,
            stream_outcomes,
            dropped_params,
            catalog_failures,
        }
    })
}

/// Get the global metrics instance, registering it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}
