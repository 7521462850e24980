use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Pipeline Errors
// ============================================================================

/// Errors raised inside the streaming pipeline. Each variant is a distinct
/// condition a client can act on (retry, resume, or restart).
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("malformed {kind} marker: {reason}")]
    MarkerParse { kind: &'static str, reason: String },

    #[error("upstream source failed: {0}")]
    UpstreamSource(String),

    #[error("event log unavailable: {0}")]
    StoreUnavailable(String),

    #[error("session {session_id} cannot be resumed: {reason}")]
    NotResumable { session_id: String, reason: String },

    #[error("session {0} was already finalized")]
    DoubleFinalization(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("failed to persist transcript for session {session_id}: {reason}")]
    Persistence { session_id: String, reason: String },
}

impl StreamError {
    pub fn not_resumable(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotResumable {
            session_id: session_id.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the durable event log and the message store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt record at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<StoreError> for StreamError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

// ============================================================================
// HTTP Error Type
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found", resource.into()),
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

// ============================================================================
// Error Codes
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Client errors (4xx)
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    NotResumable,

    // Server errors (5xx)
    Internal,
    ServiceUnavailable,
    StorageError,
    ExternalServiceError,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::NotResumable => 410,
            Self::Internal => 500,
            Self::ServiceUnavailable => 503,
            Self::StorageError => 500,
            Self::ExternalServiceError => 502,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.http_status() < 500
    }

    pub fn is_server_error(&self) -> bool {
        self.http_status() >= 500
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::NotResumable => "NOT_RESUMABLE",
            Self::Internal => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::StorageError => "STORAGE_ERROR",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, AppError>;

// ============================================================================
// Error Response for HTTP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: AppError,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: AppError) -> Self {
        let session_id = error
            .details
            .as_ref()
            .and_then(|details| details.get("session_id"))
            .and_then(|id| id.as_str())
            .map(str::to_string);
        Self {
            error,
            session_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ============================================================================
// Error Conversion Implementations
// ============================================================================

impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        match &err {
            StreamError::NotResumable { session_id, .. } => {
                Self::new(ErrorCode::NotResumable, err.to_string()).with_details(
                    serde_json::json!({
                        "session_id": session_id,
                        "action": "start a new request",
                    }),
                )
            }
            StreamError::StoreUnavailable(_) => {
                Self::new(ErrorCode::ServiceUnavailable, err.to_string())
            }
            StreamError::UpstreamSource(_) => {
                Self::new(ErrorCode::ExternalServiceError, err.to_string())
            }
            StreamError::SessionClosed(_) | StreamError::DoubleFinalization(_) => {
                Self::new(ErrorCode::Conflict, err.to_string())
            }
            StreamError::Persistence { .. } => Self::new(ErrorCode::StorageError, err.to_string()),
            StreamError::MarkerParse { .. } => Self::bad_request(err.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        Self::new(ErrorCode::StorageError, err.to_string())
    }
}

// ============================================================================
// Backend-specific HTTP Response Conversion
// ============================================================================

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        use axum::http::StatusCode;

        log_error(&self);

        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let response = ErrorResponse::new(self);

        (status, Json(response)).into_response()
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn log_error(error: &AppError) {
    if error.code.is_server_error() {
        log::error!("{}", error);
    } else {
        log::warn!("{}", error);
    }
}

// ============================================================================
// Tests
// ============================================================================
