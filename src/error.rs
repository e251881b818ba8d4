use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Maps a poisoned lock into an internal error naming the store.
    pub fn lock_poisoned(store: &str) -> Self {
        Error::Internal(format!("failed to acquire lock on {}", store))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn from_error(err: &Error) -> Self {
        let (error, code) = match err {
            Error::NotFound(_) => ("not_found", 404),
            Error::Validation(_) => ("validation_error", 422),
            Error::Internal(_) => ("internal_error", 500),
        };
        Self {
            error: error.to_string(),
            message: err.to_string(),
            code,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
