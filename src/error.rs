/// Unified error types for Sitehost
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the site host
#[derive(Error, Debug)]
pub enum SiteError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Malformed subdomain, slug, email or request body
    #[error("Validation error: {0}")]
    Validation(String),

    /// Subdomain taken, site already claimed, or a stale billing event
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown site, subdomain or account
    #[error("Not found: {0}")]
    NotFound(String),

    /// Billing webhook signature mismatch
    #[error("Signature verification failed: {0}")]
    Signature(String),

    /// Billing provider unavailable or returned an error (retryable)
    #[error("Billing provider error: {0}")]
    ExternalProvider(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authorization errors
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Rate limiting errors
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: std::time::Duration },

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<axum::extract::rejection::JsonRejection> for SiteError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        SiteError::Validation(rejection.body_text())
    }
}

impl From<validator::ValidationErrors> for SiteError {
    fn from(errors: validator::ValidationErrors) -> Self {
        SiteError::Validation(errors.to_string())
    }
}

impl SiteError {
    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SiteError::ExternalProvider(_)
                | SiteError::Database(_)
                | SiteError::RateLimitExceeded { .. }
        )
    }
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert SiteError to HTTP response
impl IntoResponse for SiteError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            SiteError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "ValidationError",
                self.to_string(),
            ),
            SiteError::Conflict(_) => (StatusCode::CONFLICT, "ConflictError", self.to_string()),
            SiteError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", self.to_string()),
            SiteError::Signature(_) => (
                StatusCode::BAD_REQUEST,
                "SignatureError",
                "Invalid signature".to_string(),
            ),
            SiteError::ExternalProvider(_) => (
                StatusCode::BAD_GATEWAY,
                "ExternalProviderError",
                "Billing provider unavailable, please retry".to_string(),
            ),
            SiteError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "AuthenticationRequired",
                self.to_string(),
            ),
            SiteError::Authorization(_) => {
                (StatusCode::FORBIDDEN, "Forbidden", self.to_string())
            }
            SiteError::RateLimitExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RateLimitExceeded",
                "Rate limit exceeded".to_string(),
            ),
            SiteError::Database(_) | SiteError::Internal(_) | SiteError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for site host operations
pub type SiteResult<T> = Result<T, SiteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = vec![
            (SiteError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (SiteError::Conflict("taken".into()), StatusCode::CONFLICT),
            (SiteError::NotFound("site".into()), StatusCode::NOT_FOUND),
            (SiteError::Signature("mismatch".into()), StatusCode::BAD_REQUEST),
            (SiteError::ExternalProvider("down".into()), StatusCode::BAD_GATEWAY),
            (SiteError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_retryable() {
        assert!(SiteError::ExternalProvider("timeout".into()).is_retryable());
        assert!(!SiteError::Validation("bad".into()).is_retryable());
        assert!(!SiteError::Conflict("taken".into()).is_retryable());
    }
}
