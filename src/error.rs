use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Main error type for covey quota coordination
#[derive(Debug)]
pub enum CoveyError {
    /// Invalid quota, settings, or CLI arguments
    Config(String),

    /// Coordination backend unavailable or a command against it failed
    Backend(String),

    /// Join/update/leave protocol errors
    Coordination(String),

    /// Malformed registry, intent, or notification payloads
    Serialization(serde_json::Error),

    /// Operation attempted on a peer that already unregistered
    Retired(String),
}

impl fmt::Display for CoveyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoveyError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CoveyError::Backend(msg) => write!(f, "Backend error: {}", msg),
            CoveyError::Coordination(msg) => write!(f, "Coordination error: {}", msg),
            CoveyError::Serialization(err) => write!(f, "Serialization error: {}", err),
            CoveyError::Retired(peer_id) => write!(f, "Peer {} already unregistered", peer_id),
        }
    }
}

impl std::error::Error for CoveyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoveyError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, CoveyError>;

impl CoveyError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoveyError::Config(_) => StatusCode::BAD_REQUEST,
            CoveyError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoveyError::Coordination(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoveyError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoveyError::Retired(_) => StatusCode::GONE,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            CoveyError::Config(_) => "configuration_error",
            CoveyError::Backend(_) => "backend_error",
            CoveyError::Coordination(_) => "coordination_error",
            CoveyError::Serialization(_) => "serialization_error",
            CoveyError::Retired(_) => "peer_retired",
        }
    }

    /// True for failures a later retry against the backend may clear
    pub fn is_transient(&self) -> bool {
        matches!(self, CoveyError::Backend(_))
    }
}

// Axum IntoResponse implementation for the sidecar API
impl IntoResponse for CoveyError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

// Conversions from common error types
impl From<serde_json::Error> for CoveyError {
    fn from(err: serde_json::Error) -> Self {
        CoveyError::Serialization(err)
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for CoveyError {
    fn from(err: redis::RedisError) -> Self {
        CoveyError::Backend(err.to_string())
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::CoveyError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::CoveyError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! backend_error {
    ($msg:expr) => {
        $crate::error::CoveyError::Backend($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::CoveyError::Backend(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! coordination_error {
    ($msg:expr) => {
        $crate::error::CoveyError::Coordination($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::CoveyError::Coordination(format!($fmt, $($arg)*))
    };
}
