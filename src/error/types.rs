use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::services::storage::BackendError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) | AppError::Server(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Don't expose internal error details
        let body = match &self {
            AppError::Internal(_) => "Internal error".to_string(),
            _ => self.to_string(),
        };

        (status, body).into_response()
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::Denied { .. } => StatusCode::FORBIDDEN,
            GatewayError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Backend(error) => match error {
                BackendError::NotFound(_) => StatusCode::NOT_FOUND,
                BackendError::AlreadyExists(_)
                | BackendError::NotADirectory(_)
                | BackendError::IsADirectory(_)
                | BackendError::DirectoryNotEmpty(_) => StatusCode::CONFLICT,
                BackendError::Unsupported(_) => StatusCode::BAD_REQUEST,
                BackendError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Message safe to return to clients
    fn public_message(&self) -> String {
        match self {
            GatewayError::Unavailable { path, .. } => {
                format!("Permissions for {} could not be determined, try again later", path)
            }
            GatewayError::Backend(BackendError::Io { path, .. }) => format!("Storage error on {}", path),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.kind(),
            "message": self.public_message(),
        });
        (status, Json(body)).into_response()
    }
}
