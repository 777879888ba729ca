//! The error taxonomy (§7) as it applies to the hub's HTTP surface.

use axum::http::StatusCode;
use std::fmt;

#[derive(Debug, Clone)]
pub enum HubError {
    /// Malformed request body, unknown counter name, missing required field.
    Validation(String),
    /// Admin endpoint without or with the wrong bearer token.
    Unauthorized,
    /// Unknown bundler id, missing receipt, missing log.
    NotFound(String),
    /// Chain RPC network error, bundler RPC network error, file-append error.
    Transient(String),
    /// Unexpected internal failure.
    Internal(String),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::Validation(m) => write!(f, "{m}"),
            HubError::Unauthorized => write!(f, "unauthorized"),
            HubError::NotFound(m) => write!(f, "{m}"),
            HubError::Transient(m) => write!(f, "{m}"),
            HubError::Internal(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for HubError {}

impl HubError {
    /// Maps the taxonomy onto HTTP status codes (§7).
    pub fn http_status(&self) -> StatusCode {
        match self {
            HubError::Validation(_) => StatusCode::BAD_REQUEST,
            HubError::Unauthorized => StatusCode::UNAUTHORIZED,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Transient(_) => StatusCode::BAD_GATEWAY,
            HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for HubError {
    fn into_response(self) -> axum::response::Response {
        let status = self.http_status();
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_maps_to_401() {
        assert_eq!(HubError::Unauthorized.http_status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(
            HubError::NotFound("bundler x".into()).http_status(),
            StatusCode::NOT_FOUND
        );
    }
}
