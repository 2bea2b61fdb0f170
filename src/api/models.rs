//! API data models

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AnalyzerError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Body of `POST /api/process-youtube`
#[derive(Debug, Default, Deserialize)]
pub struct ProcessRequest {
    pub youtube_url: Option<String>,
    #[serde(default, alias = "force_processing")]
    pub force_fresh: bool,
}

/// Query of `GET /api/analysis-status`
#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    pub key: Option<String>,
    pub youtube_url: Option<String>,
}

/// Body of `POST /api/clear-cache`
#[derive(Debug, Default, Deserialize)]
pub struct ClearRequest {
    pub youtube_url: Option<String>,
}

/// Query of `GET /api/get-most-replayed`
#[derive(Debug, Default, Deserialize)]
pub struct HeatmapQuery {
    pub url: Option<String>,
}

/// Errors surfaced by the HTTP layer
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AnalyzerError> for ApiError {
    fn from(err: AnalyzerError) -> Self {
        match err {
            AnalyzerError::ShuttingDown => ApiError::ServiceUnavailable(err.to_string()),
            AnalyzerError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            status: "error",
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
