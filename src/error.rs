/// Proxy error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Backend error: status={status}, message={message}")]
    Backend { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    Overloaded,
    ServerError,
}

/// Map a backend HTTP status code to an error category.
#[must_use]
pub fn category_from_backend_status(status: u16) -> ErrorCategory {
    match status {
        400 | 413 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        404 => ErrorCategory::NotFound,
        429 => ErrorCategory::RateLimit,
        503 | 529 => ErrorCategory::Overloaded,
        _ => ErrorCategory::ServerError,
    }
}

impl ProxyError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProxyError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            ProxyError::Auth(_) => ErrorCategory::Authentication,
            ProxyError::NotFound(_) => ErrorCategory::NotFound,
            ProxyError::Config(_) | ProxyError::Transport(_) | ProxyError::Internal(_) => {
                ErrorCategory::ServerError
            }
            ProxyError::Backend { status, .. } => category_from_backend_status(*status),
        }
    }
}

// ---------------------------------------------------------------------------
// Category -> HTTP status code / Anthropic error type
// ---------------------------------------------------------------------------

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::NotFound => http::StatusCode::NOT_FOUND,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::Overloaded => http::StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::ServerError => http::StatusCode::BAD_GATEWAY,
    }
}

fn anthropic_error_type(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest => "invalid_request_error",
        ErrorCategory::Authentication => "authentication_error",
        ErrorCategory::Permission => "permission_error",
        ErrorCategory::NotFound => "not_found_error",
        ErrorCategory::RateLimit => "rate_limit_error",
        ErrorCategory::Overloaded => "overloaded_error",
        ErrorCategory::ServerError => "api_error",
    }
}

/// Anthropic-shaped error body.
#[must_use]
pub fn anthropic_error_payload(cat: ErrorCategory, message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "error": {
            "type": anthropic_error_type(cat),
            "message": message,
        }
    })
}

/// Format an error, returning (`status_code`, JSON body).
#[must_use]
pub fn format_error(err: &ProxyError) -> (http::StatusCode, serde_json::Value) {
    let cat = err.category();
    let status = match (cat, err) {
        (ErrorCategory::ServerError, ProxyError::Internal(_) | ProxyError::Config(_)) => {
            http::StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => http_status_for_category(cat),
    };
    (status, anthropic_error_payload(cat, &err.to_string()))
}

// ---------------------------------------------------------------------------
// Axum integration
// ---------------------------------------------------------------------------

#[must_use]
pub fn into_axum_response(err: &ProxyError) -> axum::response::Response {
    use axum::response::IntoResponse;
    let (status, body) = format_error(err);
    (status, axum::Json(body)).into_response()
}

impl axum::response::IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        into_axum_response(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_status_maps_to_category() {
        assert_eq!(category_from_backend_status(429), ErrorCategory::RateLimit);
        assert_eq!(category_from_backend_status(529), ErrorCategory::Overloaded);
        assert_eq!(category_from_backend_status(500), ErrorCategory::ServerError);
    }

    #[test]
    fn invalid_request_is_400_with_anthropic_shape() {
        let (status, body) = format_error(&ProxyError::InvalidRequest("no messages".into()));
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert!(body["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("no messages")));
    }

    #[test]
    fn internal_error_is_500() {
        let (status, body) = format_error(&ProxyError::Internal("boom".into()));
        assert_eq!(status, http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["type"], "api_error");
    }
}
