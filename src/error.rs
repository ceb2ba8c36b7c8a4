//! # Error Handling
//!
//! HTTP-facing error type for the voice-call service and its conversion into
//! JSON error responses.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: Each variant is one failure category the API can report
//! - **Data**: Each variant carries a human-readable message
//! - **Pattern matching**: `match` maps every variant to an HTTP status code
//!
//! ### Traits for Error Conversion
//! - **ResponseError trait**: Lets actix-web render an `AppError` as a response
//! - **Into<actix_web::Error>**: Extractor failures are rendered the same way
//! - **Display trait**: Defines how errors are formatted as strings
//!
//! Domain errors (wire codec, backends, session registry) live next to the
//! code that raises them and are converted into `AppError` at the handler
//! boundary.

use actix_web::{web, HttpResponse, ResponseError}; // Web framework error handling
use serde_json::json; // For creating JSON error responses
use std::fmt; // For implementing Display trait

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **NotFound**: Session or character doesn't exist (404)
/// - **Unauthorized**: Missing or invalid caller identity / token (401)
/// - **Upstream**: A speech or generation backend failed (502)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Caller could not be authenticated
    Unauthorized(String),

    /// An upstream provider (transcription, generation, synthesis) failed
    Upstream(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "session abc is not registered",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::Unauthorized(msg) => ("unauthorized", msg),
            AppError::Upstream(msg) => ("upstream_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// JSON body extractor settings: malformed bodies become a 400 in the
/// same `{"error": {...}}` shape as every other failure.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| AppError::BadRequest(format!("Invalid JSON body: {}", err)).into())
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
