//! Mapping of domain errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::alerts::AlertError;
use crate::baseline::mode::ModeError;
use crate::baseline::BaselineError;
use crate::detect::EngineError;
use crate::equity::EquityError;
use crate::model::ValidationError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m.clone()),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "data_unavailable", m.clone()),
            ApiError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{:#}", e)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            error!(code, "request failed: {}", message);
        }
        let body = json!({
            "data": null,
            "error": { "code": code, "message": message },
            "meta": {
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl From<AlertError> for ApiError {
    fn from(e: AlertError) -> Self {
        match e {
            AlertError::NotFound(_) => ApiError::NotFound(e.to_string()),
            AlertError::InvalidConfidence(_) => ApiError::BadRequest(e.to_string()),
            AlertError::IllegalTransition { .. }
            | AlertError::FeedbackAlreadyRecorded(_)
            | AlertError::FeedbackOnResolved(_)
            | AlertError::ConcurrentUpdateConflict(_) => ApiError::Conflict(e.to_string()),
            AlertError::Storage(inner) => ApiError::Internal(inner),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Validation(v) => v.into(),
            EngineError::DataUnavailable(s) => ApiError::Unavailable(s.to_string()),
            EngineError::Alert(a) => a.into(),
        }
    }
}

impl From<ModeError> for ApiError {
    fn from(e: ModeError) -> Self {
        match e {
            ModeError::MissingJustification => ApiError::BadRequest(e.to_string()),
            ModeError::Audit(inner) => ApiError::Internal(inner),
        }
    }
}

impl From<EquityError> for ApiError {
    fn from(e: EquityError) -> Self {
        match e {
            EquityError::MissingJustification => ApiError::BadRequest(e.to_string()),
            EquityError::Baseline(BaselineError::UnknownContext(_)) => ApiError::NotFound(e.to_string()),
            EquityError::Baseline(BaselineError::InvalidFactor(_)) => ApiError::BadRequest(e.to_string()),
            EquityError::Audit(inner) => ApiError::Internal(inner),
        }
    }
}
