use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to decode input image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
    #[error("compute device error: {0}")]
    Device(String),
    #[error("failed to encode output image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("inference did not finish within {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tch::TchError> for ServiceError {
    fn from(err: tch::TchError) -> Self {
        ServiceError::Device(err.to_string())
    }
}

impl ServiceError {
    pub fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        ServiceError::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Decode(_) => "decode",
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::ShapeMismatch { .. } => "shape_mismatch",
            ServiceError::Device(_) => "device",
            ServiceError::Encode(_) => "encode",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::Io(_) => "io",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        // Every failure collapses into one generic response; the variant only shows up in logs.
        tracing::error!(error = %self, kind = self.kind(), "request failed");

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
    }
}
