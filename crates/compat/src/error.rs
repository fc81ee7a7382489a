//! Adapter error taxonomy and the two wire dialects for error bodies.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

use crate::decode::DecodeError;

pub(crate) type Result<T> = std::result::Result<T, CompatError>;

/// Request-path failures. Everything upstream-origin maps to 502 unless the
/// upstream itself responded, in which case its status is mirrored by the
/// forwarding helpers instead of this enum.
#[derive(Debug, Error)]
pub(crate) enum CompatError {
    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("invalid json (adapter request decode failed: {0})")]
    Decode(#[from] DecodeError),

    /// Network/DNS/TLS failure before any upstream HTTP response.
    #[error("upstream request failed: {0}")]
    UpstreamTransport(String),

    /// The upstream answered 2xx but the body was not usable JSON.
    #[error("invalid upstream response")]
    InvalidUpstreamResponse,

    #[error("internal adapter error")]
    Internal,
}

impl CompatError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamTransport(_) | Self::InvalidUpstreamResponse => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn message_or_reason(status: StatusCode, message: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        status.canonical_reason().unwrap_or("error").to_string()
    } else {
        message.to_string()
    }
}

/// OpenAI-style error body: `{"error":{"message":…,"type":"invalid_request_error"}}`.
pub(crate) fn openai_error(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "error": {
            "message": message_or_reason(status, message),
            "type": "invalid_request_error",
        }
    });
    (status, Json(body)).into_response()
}

/// Anthropic-style error body: `{"type":"error","error":{…}}`.
pub(crate) fn anthropic_error(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "type": "error",
        "error": {
            "type": "invalid_request_error",
            "message": message_or_reason(status, message),
        }
    });
    (status, Json(body)).into_response()
}

/// Forwards an upstream error body at its original status: valid JSON passes
/// through untouched, anything else is wrapped in the OpenAI error shape.
pub(crate) fn forward_upstream_error(status: StatusCode, body: &[u8]) -> Response {
    if let Ok(decoded) = serde_json::from_slice::<Value>(body) {
        if decoded.is_object() {
            return (status, Json(decoded)).into_response();
        }
    }
    let text = String::from_utf8_lossy(body);
    openai_error(status, text.trim())
}

impl IntoResponse for CompatError {
    fn into_response(self) -> Response {
        openai_error(self.status_code(), &self.to_string())
    }
}

/// Wrapper selecting the Anthropic error dialect for the same taxonomy.
#[derive(Debug)]
pub(crate) struct AnthropicCompatError(pub CompatError);

impl From<CompatError> for AnthropicCompatError {
    fn from(error: CompatError) -> Self {
        Self(error)
    }
}

impl IntoResponse for AnthropicCompatError {
    fn into_response(self) -> Response {
        anthropic_error(self.0.status_code(), &self.0.to_string())
    }
}
