//! Shared constants for structured API errors and stream outcome labels.

use std::fmt;

pub const ERROR_TYPE_UNAUTHENTICATED: &str = "unauthenticated";
pub const ERROR_TYPE_MALFORMED_REQUEST: &str = "malformed_request";
pub const ERROR_TYPE_MODEL_NOT_FOUND: &str = "model_not_found";
pub const ERROR_TYPE_BACKEND_REJECTED: &str = "backend_rejected";
pub const ERROR_TYPE_BACKEND_UNAVAILABLE: &str = "backend_unavailable";
pub const ERROR_TYPE_BACKEND_TIMEOUT: &str = "backend_timeout";
pub const ERROR_TYPE_INTERNAL: &str = "internal_error";

pub const STREAM_OUTCOME_COMPLETED: &str = "completed";
pub const STREAM_OUTCOME_CLIENT_DISCONNECT: &str = "client_disconnect";
pub const STREAM_OUTCOME_ERRORED: &str = "errored";

/// Error taxonomy exposed to clients in the `type` field of error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unauthenticated,
    MalformedRequest,
    ModelNotFound,
    BackendRejected,
    BackendUnavailable,
    BackendTimeout,
    InternalError,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => ERROR_TYPE_UNAUTHENTICATED,
            Self::MalformedRequest => ERROR_TYPE_MALFORMED_REQUEST,
            Self::ModelNotFound => ERROR_TYPE_MODEL_NOT_FOUND,
            Self::BackendRejected => ERROR_TYPE_BACKEND_REJECTED,
            Self::BackendUnavailable => ERROR_TYPE_BACKEND_UNAVAILABLE,
            Self::BackendTimeout => ERROR_TYPE_BACKEND_TIMEOUT,
            Self::InternalError => ERROR_TYPE_INTERNAL,
        }
    }

    /// Whether a failure of this kind can be retried with another credential set.
    pub const fn allows_failover(self) -> bool {
        matches!(
            self,
            Self::BackendRejected | Self::BackendUnavailable | Self::BackendTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome of a streaming session, used for metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    ClientDisconnect,
    Errored,
}

impl StreamOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => STREAM_OUTCOME_COMPLETED,
            Self::ClientDisconnect => STREAM_OUTCOME_CLIENT_DISCONNECT,
            Self::Errored => STREAM_OUTCOME_ERRORED,
        }
    }
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
