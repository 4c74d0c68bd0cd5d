use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::{backend::registry::ResolveError, extract::ExtractError, store::StoreError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let payload = ErrorBody {
            error: self.to_string(),
        };

        (status, Json(payload)).into_response()
    }
}

impl From<ResolveError> for AppError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::ConfigNotFound(_) => AppError::NotFound(error.to_string()),
            ResolveError::Unauthorized => AppError::Unauthorized(error.to_string()),
        }
    }
}

impl From<ExtractError> for AppError {
    fn from(error: ExtractError) -> Self {
        match error {
            ExtractError::MissingContent | ExtractError::MissingModel => {
                AppError::BadRequest(error.to_string())
            }
            ExtractError::Resolve(inner) => inner.into(),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        AppError::Internal(format!("failed to save configuration: {error}"))
    }
}
