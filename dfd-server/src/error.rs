//! HTTP error responses
//!
//! Clients get a short plain-text message; the full cause goes to the log.

use crate::pipeline::PipelineError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("{0}")]
    BadRequest(String),

    /// Internal server error (500)
    #[error("{0}")]
    Internal(String),

    /// Classifier slots exhausted (503)
    #[error("{0}")]
    ServiceUnavailable(String),

    /// Classifier deadline elapsed (504)
    #[error("{0}")]
    GatewayTimeout(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match &err {
            PipelineError::FormParse(detail) => {
                warn!("Error parsing form: {}", detail);
                ApiError::BadRequest("Error parsing form".to_string())
            }
            PipelineError::UnsupportedFileType(name) => {
                warn!(declared_name = %name, "Rejected upload with unsupported file type");
                ApiError::BadRequest("Unsupported file type".to_string())
            }
            PipelineError::FileFieldMissing => {
                warn!("Error retrieving file: {}", err);
                ApiError::Internal("Error retrieving file".to_string())
            }
            PipelineError::Busy(rejected) => {
                warn!("{}", rejected);
                ApiError::ServiceUnavailable("Server busy, try again later".to_string())
            }
            PipelineError::DirectoryCreation(source) => {
                error!("Error creating uploads directory: {}", source);
                ApiError::Internal("Error creating uploads directory".to_string())
            }
            PipelineError::Write(source) => {
                error!("Error saving file: {}", source);
                ApiError::Internal("Error saving file".to_string())
            }
            PipelineError::ClassifierProcess(source) => {
                error!("Error processing video: {}", source);
                ApiError::Internal(format!("Error processing video: {}", source))
            }
            PipelineError::ClassifierTimeout(timeout) => {
                error!(timeout_secs = timeout.as_secs(), "Error processing video: {}", err);
                ApiError::GatewayTimeout(format!("Error processing video: {}", err))
            }
            PipelineError::UnrecognizedOutput(source) => {
                error!("Error processing video: {}", source);
                ApiError::Internal("Error processing video: unrecognized classifier output".to_string())
            }
            PipelineError::TemplateLoad(source) => {
                error!("Error loading template: {}", source);
                ApiError::Internal("Error loading template".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::GatewayTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
        };

        // String bodies are sent as text/plain; charset=utf-8
        (status, message).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
