//! Error handling for the feedveil pipeline
//!
//! One structured error type covers configuration, storage, the classification
//! transport and the settings surface. Extraction misses are not errors; the
//! scanner reports them as `None`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for feedveil
#[derive(Error, Debug)]
pub enum VeilError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Database operation failed: {operation} - {source}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Network operation failed: {operation}")]
    Network {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Classification rejected with status {status}: {body}")]
    ClassificationRejected { status: u16, body: String },

    #[error("Malformed assessment: {reason}")]
    MalformedAssessment { reason: String },

    #[error("Operation timed out: {operation} after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Mutex lock failed: {resource}")]
    MutexPoisoned { resource: String },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {resource} - {id}")]
    NotFound { resource: String, id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Result with VeilError
pub type VeilResult<T> = Result<T, VeilError>;

impl VeilError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Create a network error
    pub fn network(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            operation: operation.into(),
            source,
        }
    }

    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        Self::ClassificationRejected {
            status,
            body: body.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedAssessment {
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for every failure of the classification round trip. These are
    /// answered with the fail-open fallback assessment.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            VeilError::Network { .. }
                | VeilError::ClassificationRejected { .. }
                | VeilError::MalformedAssessment { .. }
                | VeilError::Timeout { .. }
        )
    }
}

impl IntoResponse for VeilError {
    fn into_response(self) -> Response {
        let status = match self {
            VeilError::Config { .. }
            | VeilError::Serialization { .. }
            | VeilError::Validation { .. } => StatusCode::BAD_REQUEST,
            VeilError::NotFound { .. } => StatusCode::NOT_FOUND,
            VeilError::Network { .. }
            | VeilError::ClassificationRejected { .. }
            | VeilError::MalformedAssessment { .. } => StatusCode::BAD_GATEWAY,
            VeilError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            // Default to 500 for server-side failures
            VeilError::Database { .. }
            | VeilError::MutexPoisoned { .. }
            | VeilError::Io { .. }
            | VeilError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

/// Helper trait for safe mutex operations
///
/// Returns a VeilError on poison instead of panicking.
pub trait SafeLock<T: ?Sized> {
    /// Safely lock a mutex, returning a VeilError on poison
    fn safe_lock(&self) -> VeilResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> VeilResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| VeilError::MutexPoisoned {
            resource: "generic_mutex".to_string(),
        })
    }
}

/// Convert from sled errors
impl From<sled::Error> for VeilError {
    fn from(err: sled::Error) -> Self {
        VeilError::database("sled_operation", err)
    }
}

/// Convert from serde_json errors
impl From<serde_json::Error> for VeilError {
    fn from(err: serde_json::Error) -> Self {
        VeilError::serialization("json_operation", err)
    }
}

/// Convert from std::io errors
impl From<std::io::Error> for VeilError {
    fn from(err: std::io::Error) -> Self {
        VeilError::io("io_operation", err)
    }
}

/// Convert from reqwest errors
impl From<reqwest::Error> for VeilError {
    fn from(err: reqwest::Error) -> Self {
        VeilError::network("http_request", err)
    }
}

impl From<figment::Error> for VeilError {
    fn from(err: figment::Error) -> Self {
        VeilError::config(err.to_string())
    }
}
