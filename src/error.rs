// Centralized API error type for all handlers.
// Every 4xx/5xx response body renders the OpenAI-style envelope:
//
// ```json
// {
//   "error": {
//     "message": "Human-readable description",
//     "type": "invalid_request_error",
//     "code": "model_loading",        // optional
//     "retry_after": 2                // optional, seconds
//   }
// }
// ```
//
// Full detail is logged server-side; the client only ever sees the
// sanitized message. The `x-request-id` header is attached separately by
// the request-id middleware in lib.rs.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Not authenticated: {0}")]
    Authentication(String),

    #[error("Not permitted: {0}")]
    Permission(String),

    #[error("Context length exceeded: {0}")]
    ContextLength(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_ms: u64 },

    #[error("Service unavailable: {message}")]
    Unavailable {
        message: String,
        code: Option<&'static str>,
        retry_after: Option<u64>,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {message}")]
    Server {
        message: String,
        code: Option<&'static str>,
    },

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl ApiError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError::Server {
            message: msg.into(),
            code: None,
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        ApiError::Unavailable {
            message: msg.into(),
            code: None,
            retry_after: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::ContextLength(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ApiError::Permission(_) => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Server { .. } | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI envelope `type` field.
    fn error_type(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_)
            | ApiError::ContextLength(_)
            | ApiError::NotFound(_)
            | ApiError::PayloadTooLarge(_) => "invalid_request_error",
            ApiError::Authentication(_) => "authentication_error",
            ApiError::Permission(_) => "permission_error",
            ApiError::RateLimited { .. } => "rate_limit_error",
            ApiError::Unavailable { .. } => "service_unavailable",
            ApiError::Upstream(_) | ApiError::Server { .. } | ApiError::Store(_) => "server_error",
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            ApiError::ContextLength(_) => Some("context_length_exceeded"),
            ApiError::NotFound(_) => Some("model_not_found"),
            ApiError::PayloadTooLarge(_) => Some("payload_too_large"),
            ApiError::RateLimited { .. } => Some("rate_limit_exceeded"),
            ApiError::Unavailable { code, .. } => *code,
            ApiError::Server { code, .. } => *code,
            _ => None,
        }
    }

    /// Retry hint in whole seconds, used for both the envelope field and
    /// the `Retry-After` header.
    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after_ms } => Some(retry_after_ms.div_ceil(1000).max(1)),
            ApiError::Unavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Sanitized message safe to return to the client.
    fn client_message(&self) -> String {
        match self {
            ApiError::InvalidRequest(m)
            | ApiError::ContextLength(m)
            | ApiError::NotFound(m)
            | ApiError::PayloadTooLarge(m)
            | ApiError::Authentication(m)
            | ApiError::Permission(m) => m.clone(),
            ApiError::RateLimited { .. } => "Rate limit exceeded. Please retry later.".to_string(),
            ApiError::Unavailable { message, .. } => message.clone(),
            ApiError::Upstream(_) => "Upstream service error".to_string(),
            ApiError::Server { message, .. } => message.clone(),
            ApiError::Store(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error_type = self.error_type(), "API error ({}): {}", status.as_u16(), self);
        } else {
            tracing::warn!(error_type = self.error_type(), "API error ({}): {}", status.as_u16(), self);
        }

        let mut error = json!({
            "message": self.client_message(),
            "type": self.error_type(),
        });
        if let Some(code) = self.code() {
            error["code"] = json!(code);
        }
        if let Some(secs) = self.retry_after_secs() {
            error["retry_after"] = json!(secs);
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();
        if let Some(secs) = self.retry_after_secs() {
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_rounds_retry_after_up() {
        let err = ApiError::RateLimited { retry_after_ms: 1200 };
        assert_eq!(err.retry_after_secs(), Some(2));
        let err = ApiError::RateLimited { retry_after_ms: 10 };
        assert_eq!(err.retry_after_secs(), Some(1));
    }

    #[test]
    fn envelope_types_match_status_classes() {
        assert_eq!(ApiError::InvalidRequest("x".into()).error_type(), "invalid_request_error");
        assert_eq!(ApiError::Authentication("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Permission("x".into()).status(), StatusCode::FORBIDDEN);
        let loading = ApiError::Unavailable {
            message: "model is loading".into(),
            code: Some("model_loading"),
            retry_after: Some(2),
        };
        assert_eq!(loading.error_type(), "service_unavailable");
        assert_eq!(loading.code(), Some("model_loading"));
    }
}
