//! Error handling module
//!
//! Provides the HTTP-facing error type and its mapping from domain errors.

use crate::membership::MembershipError;
use crate::metrics;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

fn membership_status(err: &MembershipError) -> (StatusCode, &'static str) {
    match err {
        MembershipError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        MembershipError::InvalidKey(_) => (StatusCode::BAD_REQUEST, "INVALID_KEY"),
        MembershipError::UnknownField(_) => (StatusCode::UNPROCESSABLE_ENTITY, "UNKNOWN_FIELD"),
        MembershipError::InvalidValue { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_VALUE"),
        MembershipError::NotProjected { .. } => (StatusCode::BAD_REQUEST, "NOT_QUERYABLE"),
        MembershipError::ImmutableField { .. } => (StatusCode::CONFLICT, "IMMUTABLE_FIELD"),
        MembershipError::PreconditionFailed { .. } => (StatusCode::CONFLICT, "PRECONDITION_FAILED"),
        MembershipError::AmbiguousResult { .. } => (StatusCode::CONFLICT, "AMBIGUOUS_RESULT"),
        MembershipError::StoreUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
        MembershipError::TransitionFailed { .. } => (StatusCode::SERVICE_UNAVAILABLE, "TRANSITION_FAILED"),
        MembershipError::Corruption { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CORRUPT_RECORD"),
        MembershipError::UnexpectedColumn { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "UNEXPECTED_COLUMN"),
        MembershipError::Encoding(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ENCODING_ERROR"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Membership(e) => {
                let (status, code) = membership_status(e);
                if e.is_store_failure() {
                    metrics::record_store_failure();
                    error!("Store failure: {:?}", e);
                    (status, code, "The record store is unavailable".to_string(), Some(e.to_string()))
                } else if status.is_server_error() {
                    error!("Record integrity fault: {}", e);
                    (status, code, "A stored record is damaged".to_string(), Some(e.to_string()))
                } else {
                    warn!("Request refused ({}): {}", e.reason(), e);
                    (status, code, e.to_string(), None)
                }
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
                None,
            ),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Helper function to create a bad request error
pub fn bad_request(msg: impl Into<String>) -> AppError {
    AppError::BadRequest(msg.into())
}
