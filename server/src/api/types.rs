//! Shared API types and error mapping

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::data::StorageError;

/// Standard API error response
#[derive(Debug)]
pub enum ApiError {
    BadRequest { code: String, message: String },
    NotFound { code: String, message: String },
    Internal,
}

impl ApiError {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotFound {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Map storage errors onto HTTP semantics: validation problems are the
    /// caller's fault, everything else is reported as an internal error
    /// without leaking details.
    pub fn from_storage(e: StorageError) -> Self {
        match e {
            StorageError::UnknownMetricId => Self::not_found("UNKNOWN_METRIC", "Unknown metric ID"),
            StorageError::InvalidFromTo => {
                Self::bad_request("INVALID_TIME_RANGE", "Invalid 'from' and 'to' parameters")
            }
            StorageError::InvalidAggregator => {
                Self::bad_request("INVALID_AGGREGATOR", "Invalid 'aggregator' parameter")
            }
            other => {
                tracing::error!(error = %other, "Failed to get metric(s) from storage!");
                Self::Internal
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            ApiError::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL".to_string(),
                "Internal server error".to_string(),
            ),
        };

        (
            status,
            Json(ErrorBody {
                error: ErrorDetail { code, message },
            }),
        )
            .into_response()
    }
}
