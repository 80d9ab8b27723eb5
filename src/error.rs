// Error handling module
// Defines the request error taxonomy and user-facing failure messages

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Shown when a login attempt is rejected with 401
pub const MSG_INVALID_CREDENTIALS: &str = "Invalid email or password.";

/// Shown when a login attempt is rejected with 422
pub const MSG_INVALID_INPUT: &str = "Invalid input. Please check your email and password.";

/// Shown when the backend fails with a 5xx status
pub const MSG_SERVER_ERROR: &str = "Server error. Please try again later.";

/// Fallback for anything the classification does not cover
pub const MSG_GENERIC: &str = "Something went wrong. Please try again.";

/// Re-authentication prompt after an unrecoverable auth failure
pub const MSG_SESSION_EXPIRED: &str = "Your session has expired. Please sign in again.";

/// Body of a non-success response, parsed once when the response arrives
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ErrorBody {
    #[default]
    Empty,
    /// Plain text, or a JSON document that is a single string
    Text(String),
    /// Any other JSON document
    Json(Value),
}

impl ErrorBody {
    /// Parse raw response bytes
    pub fn parse(bytes: &[u8]) -> Self {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return ErrorBody::Empty;
        }

        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::String(text)) => ErrorBody::Text(text),
            Ok(value) => ErrorBody::Json(value),
            Err(_) => ErrorBody::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    /// The `detail` field of a structured body, if any
    fn detail(&self) -> Option<&Value> {
        match self {
            ErrorBody::Json(value) => value.get("detail"),
            _ => None,
        }
    }
}

/// Errors surfaced by every outbound API call
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// No response was received at all
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// 401, or a renewal that could not produce a new credential
    #[error("Authentication expired")]
    AuthExpired { body: ErrorBody },

    /// 403
    #[error("Access forbidden")]
    AuthForbidden { body: ErrorBody },

    /// 429, retryable
    #[error("Rate limited")]
    RateLimited { body: ErrorBody },

    /// 422
    #[error("Validation error")]
    ValidationError { body: ErrorBody },

    /// 5xx
    #[error("Server error: {status}")]
    ServerError { status: u16, body: ErrorBody },

    /// Any other status
    #[error("Unexpected response: {status}")]
    Unknown { status: u16, body: ErrorBody },

    /// A success response whose body could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The operation was cancelled before it settled
    #[error("Operation cancelled")]
    Cancelled,
}

impl ApiError {
    /// Categorize a non-success response
    pub fn from_status(status: StatusCode, body: ErrorBody) -> Self {
        match status.as_u16() {
            401 => ApiError::AuthExpired { body },
            403 => ApiError::AuthForbidden { body },
            422 => ApiError::ValidationError { body },
            429 => ApiError::RateLimited { body },
            code @ 500..=599 => ApiError::ServerError { status: code, body },
            code => ApiError::Unknown { status: code, body },
        }
    }

    /// A renewal failure that carries no response of its own
    pub fn auth_expired() -> Self {
        ApiError::AuthExpired {
            body: ErrorBody::Empty,
        }
    }

    /// HTTP status this error was built from, if one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::AuthExpired { .. } => Some(401),
            ApiError::AuthForbidden { .. } => Some(403),
            ApiError::ValidationError { .. } => Some(422),
            ApiError::RateLimited { .. } => Some(429),
            ApiError::ServerError { status, .. } | ApiError::Unknown { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Response body this error was built from, if one was received
    pub fn body(&self) -> Option<&ErrorBody> {
        match self {
            ApiError::AuthExpired { body }
            | ApiError::AuthForbidden { body }
            | ApiError::RateLimited { body }
            | ApiError::ValidationError { body }
            | ApiError::ServerError { body, .. }
            | ApiError::Unknown { body, .. } => Some(body),
            _ => None,
        }
    }

    /// 401/403: the session must end
    pub fn is_definitive_auth_failure(&self) -> bool {
        matches!(
            self,
            ApiError::AuthExpired { .. } | ApiError::AuthForbidden { .. }
        )
    }

    /// Failures that must never end a session on their own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::NetworkUnavailable(_)
                | ApiError::ServerError { .. }
                | ApiError::RateLimited { .. }
        )
    }

    /// Message shown to the user for a failure outside the login form
    pub fn user_message(&self) -> String {
        match self {
            ApiError::AuthExpired { .. } | ApiError::AuthForbidden { .. } => {
                MSG_SESSION_EXPIRED.to_string()
            }
            ApiError::ValidationError { .. } => login_failure_message(self),
            ApiError::ServerError { .. } => MSG_SERVER_ERROR.to_string(),
            _ => MSG_GENERIC.to_string(),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return ApiError::InvalidResponse(e.to_string());
        }

        let error_kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else {
            "unknown"
        };

        ApiError::NetworkUnavailable(format!("{} ({})", e, error_kind))
    }
}

/// A failed login, with the message to render on the login form
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct LoginError {
    pub message: String,
    #[source]
    pub cause: ApiError,
}

impl From<ApiError> for LoginError {
    fn from(cause: ApiError) -> Self {
        Self {
            message: login_failure_message(&cause),
            cause,
        }
    }
}

/// Build the message shown inline on the login form
///
/// Order of precedence:
/// - a string response body is shown verbatim
/// - a structured `detail` field is shown verbatim if it is a string,
///   otherwise a generic message
/// - otherwise the status decides: 401, 422, 5xx, anything else
pub fn login_failure_message(err: &ApiError) -> String {
    match err.body() {
        Some(ErrorBody::Text(text)) => return text.clone(),
        Some(body @ ErrorBody::Json(_)) => {
            if let Some(detail) = body.detail() {
                return match detail {
                    Value::String(text) => text.clone(),
                    _ => MSG_GENERIC.to_string(),
                };
            }
        }
        _ => {}
    }

    match err.status() {
        Some(401) => MSG_INVALID_CREDENTIALS.to_string(),
        Some(422) => MSG_INVALID_INPUT.to_string(),
        Some(status) if status >= 500 => MSG_SERVER_ERROR.to_string(),
        _ => MSG_GENERIC.to_string(),
    }
}
