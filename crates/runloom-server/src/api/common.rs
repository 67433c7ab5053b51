// Common DTOs and error mapping for the public API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use runloom_engine::{EngineError, StoreError};
use serde::{Deserialize, Serialize};

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Engine error carried through a handler
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidArgument(_) | EngineError::UnknownNodeType(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::AlreadyExists(_)
            | EngineError::StaleClaim(_)
            | EngineError::DependenciesNotReady(_) => StatusCode::CONFLICT,
            EngineError::NodeExecution { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Store(store) => match store {
                StoreError::RunNotFound(_)
                | StoreError::StepNotFound(_)
                | StoreError::ItemNotFound(_)
                | StoreError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
                StoreError::RunExists(_)
                | StoreError::StaleClaim { .. }
                | StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
                StoreError::Database(_) | StoreError::Serialization(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        };

        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        (status, Json(ErrorResponse::new(self.0.to_string()))).into_response()
    }
}
