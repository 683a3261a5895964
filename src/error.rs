use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced on the Anthropic-facing HTTP surface.
///
/// Every variant maps to the Anthropic error envelope
/// `{"type":"error","error":{"type":...,"message":...}}`, except
/// [`ProxyError::Forbidden`] which keeps the bare `{"error":"Forbidden"}`
/// body the user-agent gate promises.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed request body or parameters.
    #[error("{0}")]
    InvalidRequest(String),
    /// The requested model is not in the catalog.
    #[error("model `{0}` is not available")]
    UnknownModel(String),
    /// Request rejected by the user-agent gate.
    #[error("Forbidden")]
    Forbidden,
    /// The session library failed to open or drive a session.
    #[error("session error: {0}")]
    Session(String),
    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            ProxyError::Forbidden => StatusCode::FORBIDDEN,
            ProxyError::Session(_) | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::UnknownModel(_) => "invalid_request_error",
            ProxyError::Forbidden => "permission_error",
            ProxyError::Session(_) | ProxyError::Internal(_) => "api_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();

        if matches!(self, ProxyError::Forbidden) {
            return (status, Json(json!({ "error": "Forbidden" }))).into_response();
        }

        let body = json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
