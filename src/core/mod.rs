//! Core functionality for the Bedrock proxy.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Logging context
//! - Metrics collection
//! - HTTP middleware
//! - Stream cancellation

pub mod cancel;
pub mod config;
pub mod error;
pub mod error_types;
pub mod logging;
pub mod metrics;
pub mod middleware;

// Re-export commonly used types
pub use cancel::StreamCancelHandle;
pub use config::{AppConfig, AuthMode, BackendConfig, ServerConfig};
pub use error::{AppError, Result};
pub use error_types::{ErrorKind, StreamOutcome};
pub use logging::{generate_request_id, get_request_id, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{request_id_middleware, MetricsMiddleware, ModelName};
