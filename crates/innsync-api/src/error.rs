use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use innsync_core::sync::WebhookError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Too many requests: {0}")]
    TooManyRequests(String, u64),
    #[error("External dependency error: {0}")]
    External(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn too_many_requests(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::TooManyRequests(message.into(), retry_after_secs)
    }
}

impl From<innsync_core::Error> for AppError {
    fn from(error: innsync_core::Error) -> Self {
        use innsync_core::Error;

        match error {
            Error::NotFound(message) => Self::NotFound(message),
            Error::InvalidInput(message) | Error::Validation(message) => Self::BadRequest(message),
            Error::AlreadyExists(message) => Self::Conflict(message),
            Error::LockUnavailable(message) | Error::StaleWrite(message) => {
                Self::Conflict(message)
            }
            Error::Channel(error) => Self::External(error.to_string()),
            Error::Pms(message) => Self::External(message),
            other => {
                tracing::error!(error = %other, "Request failed");
                Self::Internal("unexpected failure".to_string())
            }
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(error: WebhookError) -> Self {
        match error {
            WebhookError::MissingSignature
            | WebhookError::InvalidSignature
            | WebhookError::StaleTimestamp => Self::Unauthorized(error.to_string()),
            WebhookError::MalformedPayload(message) => Self::BadRequest(message),
            WebhookError::Storage(error) => error.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests(_, _) => StatusCode::TOO_MANY_REQUESTS,
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry_after = match &self {
            Self::TooManyRequests(_, secs) => {
                HeaderValue::from_str(&(*secs).max(1).to_string()).ok()
            }
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_statuses() {
        let cases = [
            (innsync_core::Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (innsync_core::Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (innsync_core::Error::AlreadyExists("x".into()), StatusCode::CONFLICT),
            (innsync_core::Error::Pms("x".into()), StatusCode::BAD_GATEWAY),
            (innsync_core::Error::Database("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(AppError::from(error).into_response().status(), status);
        }
    }

    #[test]
    fn internal_details_are_not_echoed() {
        let error =
            AppError::from(innsync_core::Error::Database("table sync_logs is locked".into()));
        assert!(!error.to_string().contains("sync_logs"));
    }

    #[test]
    fn throttled_responses_carry_retry_after() {
        let response = AppError::too_many_requests("slow down", 12).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "12");
    }

    #[test]
    fn signature_failures_are_unauthorized() {
        let response = AppError::from(WebhookError::InvalidSignature).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
