//! HTTP mapping for engine and request-level errors.
//!
//! The engine's error taxonomy already distinguishes caller mistakes
//! from engine faults, so the handlers wrap it instead of re-deriving
//! messages; the only errors minted here are rejections of the request
//! shape itself. Every response body is `{"error": {"kind", "message"}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use ember_core::Error as EngineError;

pub enum ApiError {
    /// The request body is unusable before it reaches the engine.
    InvalidRequest(String),
    /// No live or finished request under this id.
    UnknownRequest(String),
    /// Cancel arrived after the request reached a terminal state.
    AlreadyFinished(String),
    /// Everything the engine itself rejected or failed on.
    Engine(EngineError),
}

impl ApiError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn unknown_request(request_id: &str) -> Self {
        Self::UnknownRequest(request_id.to_string())
    }

    pub fn already_finished(request_id: &str) -> Self {
        Self::AlreadyFinished(request_id.to_string())
    }

    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::UnknownRequest(_) => (StatusCode::NOT_FOUND, "unknown_request"),
            Self::AlreadyFinished(_) => (StatusCode::CONFLICT, "already_finished"),
            Self::Engine(error) => match error {
                EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "unknown_request"),
                EngineError::DuplicateId(_) => (StatusCode::CONFLICT, "duplicate_id"),
                EngineError::Config(_) | EngineError::Tokenization(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_request")
                }
                EngineError::Shutdown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
                EngineError::NoCapacity(_) => (StatusCode::SERVICE_UNAVAILABLE, "over_capacity"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
        }
    }

    fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message) => message.clone(),
            Self::UnknownRequest(id) => format!("no request with id {id}"),
            Self::AlreadyFinished(id) => format!("request {id} already finished"),
            Self::Engine(error) => error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let body = Json(json!({
            "error": {
                "kind": kind,
                "message": self.message(),
            }
        }));
        (status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self::Engine(error)
    }
}
