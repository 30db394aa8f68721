//! # Error Handling
//!
//! Two error types live here:
//!
//! - **SessionError**: failures inside a live conversation session (microphone access,
//!   the streaming connection, audio decoding, report generation). These never become
//!   HTTP responses directly; the browser socket turns them into `error` messages.
//! - **AppError**: failures of the HTTP surface (config endpoints, report endpoint),
//!   converted into JSON error responses through actix's `ResponseError` trait.
//!
//! ## Key Rust Concepts for Error Handling:
//! - **Result<T, E>**: every fallible operation says so in its signature
//! - **Enums for error kinds**: each variant is one failure category, carrying a message
//! - **From trait**: lets `?` convert between error types automatically
//! - **Display trait**: how an error reads when logged or sent to a client

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors raised while running a live conversation session.
///
/// ## Error Categories:
/// - **Permission**: the user denied microphone access (never retried)
/// - **Device**: an audio device could not be opened or went away
/// - **Connection**: the streaming connection failed to open or broke
/// - **Protocol**: the remote service sent something we could not understand
/// - **Decode**: an inbound audio chunk was malformed (non-fatal, chunk is dropped)
/// - **Evaluation**: the report generation request failed
/// - **Config**: the session was started with an unusable configuration
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Permission(String),
    Device(String),
    Connection(String),
    Protocol(String),
    Decode(String),
    Evaluation(String),
    Config(String),
}

impl SessionError {
    /// Machine-readable code used in `error` messages to the browser.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Permission(_) => "permission_denied",
            SessionError::Device(_) => "device_error",
            SessionError::Connection(_) => "connection_error",
            SessionError::Protocol(_) => "protocol_error",
            SessionError::Decode(_) => "decode_error",
            SessionError::Evaluation(_) => "evaluation_error",
            SessionError::Config(_) => "config_error",
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Permission(msg) => write!(f, "Microphone permission denied: {}", msg),
            SessionError::Device(msg) => write!(f, "Audio device error: {}", msg),
            SessionError::Connection(msg) => write!(f, "Connection error: {}", msg),
            SessionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SessionError::Decode(msg) => write!(f, "Audio decode error: {}", msg),
            SessionError::Evaluation(msg) => write!(f, "Evaluation failed: {}", msg),
            SessionError::Config(msg) => write!(f, "Session configuration error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// Stream and handshake failures from the websocket client all count as connection errors.
impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Connection(err.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::Evaluation(err.to_string())
    }
}

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: A downstream service failed or capacity is exhausted (503 errors)
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::BadRequest("Transcript is empty".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// The speech or report service is unreachable, or no session slot is free
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts `AppError` into an HTTP response.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Capture block size must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// `anyhow` is used at the edges (config loading, startup); anything that reaches a
/// handler through `?` becomes an internal error.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Session failures seen by HTTP handlers.
///
/// ## Mapping:
/// - Evaluation/Connection → 503 (the remote service is at fault)
/// - Config → 400 (the caller supplied an unusable setup)
/// - everything else → 500
impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Evaluation(_) | SessionError::Connection(_) => {
                AppError::Unavailable(err.to_string())
            }
            SessionError::Config(_) => AppError::ValidationError(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;
