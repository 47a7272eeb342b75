//! Logging utilities with request context support.
//!
//! Request ids live in task-local storage so every log line emitted while a
//! request is being served can carry the id without threading it through
//! every call.

use chrono::Local;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Mask an access key for logging: first five characters followed by `...`.
pub fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(5).collect();
    format!("{}...", visible)
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Build the filter directive string.
///
/// `RUST_LOG` wins, then the deployment's `LOG_LEVEL`. Noisy HTTP library
/// logs are always suppressed, otherwise a bare `trace` would let them through.
pub fn filter_directives(rust_log: Option<&str>, log_level: Option<&str>) -> String {
    let base = match (rust_log, log_level) {
        (Some(directives), _) if !directives.trim().is_empty() => directives.trim().to_string(),
        (_, Some(level)) if !level.trim().is_empty() => {
            let level = level.trim().to_lowercase();
            format!("{level},bedrock_proxy={level}")
        }
        _ => "info,bedrock_proxy=debug".to_string(),
    };
    format!("{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn", base)
}

/// Initialize the global tracing subscriber.
///
/// `LOG_FORMAT=json` selects structured JSON output; `NO_COLOR` disables ANSI colors.
pub fn init_tracing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let log_level = std::env::var("LOG_LEVEL").ok();
    let filter = tracing_subscriber::EnvFilter::new(filter_directives(
        rust_log.as_deref(),
        log_level.as_deref(),
    ));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let no_color = std::env::var("NO_COLOR").is_ok();

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_timer(LocalTime))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(!no_color),
            )
            .init();
    }
}
