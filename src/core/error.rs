//! Request-level errors and their JSON envelope.
//!
//! Every failure leaving the dispatcher is rendered as `{"error": ..., "message"?: ...}`
//! with the matching status code. Rate limit rejections carry extra fields and headers,
//! so they are rendered by the dispatcher itself.
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::core::forwarder::ForwardError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("Service {0} not found")]
    ServiceNotFound(String),

    #[error("Service unavailable")]
    ServiceUnavailable(String),

    #[error("Service unavailable")]
    UpstreamTimeout(String),

    #[error("Service unavailable")]
    UpstreamUnreachable(String),

    #[error("Bad request")]
    BadRequest(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Resource not found")]
    NotFound,

    #[error("Internal server error")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::ServiceNotFound(_) | GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::ServiceUnavailable(_)
            | GatewayError::UpstreamTimeout(_)
            | GatewayError::UpstreamUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Diagnostic detail for the `message` field. Internal faults stay server-side.
    fn message(&self) -> Option<&str> {
        match self {
            GatewayError::ServiceUnavailable(msg)
            | GatewayError::UpstreamTimeout(msg)
            | GatewayError::UpstreamUnreachable(msg)
            | GatewayError::BadRequest(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.to_string(),
            message: self.message().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<ForwardError> for GatewayError {
    fn from(err: ForwardError) -> Self {
        let message = err.to_string();
        match err {
            ForwardError::ServiceNotFound(service) => GatewayError::ServiceNotFound(service),
            ForwardError::ServiceUnavailable(_) => GatewayError::ServiceUnavailable(message),
            ForwardError::UpstreamTimeout { .. } => GatewayError::UpstreamTimeout(message),
            ForwardError::UpstreamUnreachable { .. } => GatewayError::UpstreamUnreachable(message),
            ForwardError::InvalidUpstreamUrl(_) => GatewayError::BadRequest(message),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal(detail) = &self {
            tracing::error!("Server error: {}", detail);
        }
        (self.status_code(), Json(self.envelope())).into_response()
    }
}
