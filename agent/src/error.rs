//! Unified error handling for the control API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sentinel_engine::ErrorClass;
use serde::Serialize;

use crate::ingest::IngestError;
use crate::store::StoreError;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("Engine error: {0}")]
    Engine(#[from] sentinel_engine::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    fn class(&self) -> Option<ErrorClass> {
        match self {
            AppError::Database(_) => Some(ErrorClass::Transient),
            AppError::Store(e) => Some(e.class()),
            AppError::Ingest(e) => e.class(),
            AppError::Engine(e) => Some(e.class()),
            AppError::BadRequest(_) | AppError::NotFound(_) => None,
        }
    }
}

fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::OutOfOrder => StatusCode::CONFLICT,
        ErrorClass::DataIntegrity => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorClass::ResourceExhausted => StatusCode::INSUFFICIENT_STORAGE,
        ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match (&self, self.class()) {
            (AppError::BadRequest(msg), _) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            (AppError::NotFound(msg), _) => (StatusCode::NOT_FOUND, msg.clone(), None),
            (AppError::Ingest(IngestError::UnknownDevice(id)), _) => (
                StatusCode::NOT_FOUND,
                format!("unknown device '{id}'"),
                None,
            ),
            (_, Some(ErrorClass::Transient)) => {
                tracing::error!("Transient error: {:?}", self);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Temporarily unavailable".to_string(),
                    Some(self.to_string()),
                )
            }
            (_, Some(class)) => {
                tracing::warn!(class = %class, "Request failed: {}", self);
                (status_for(class), class.as_str().to_string(), Some(self.to_string()))
            }
            (_, None) => (StatusCode::BAD_REQUEST, self.to_string(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
