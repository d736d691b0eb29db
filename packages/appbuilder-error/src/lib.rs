//! Shared error types for the app-builder runtime.
//!
//! Every fallible operation in the core returns [`BuilderError`]. Handlers can
//! return it directly from axum routes: the [`IntoResponse`] impl renders an
//! RFC 9457 problem-details body with a stable `error_type` discriminator,
//! while the full detail stays in the server logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine-readable error discriminators surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Init,
    SessionNotFound,
    Busy,
    Broken,
    PolicyDenied,
    OutOfSandbox,
    ToolFailure,
    Timeout,
    NoAvailablePort,
    Spawn,
    InvalidRequest,
    Internal,
}

#[derive(Debug, Error)]
pub enum BuilderError {
    /// Agent construction or workspace creation failed before the first
    /// envelope was sent.
    #[error("initialization failed: {message}")]
    Init { message: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// A turn is already in flight on this session.
    #[error("session busy: {session_id}")]
    Busy { session_id: String },

    /// The session failed a reset and accepts no further operations.
    #[error("session broken: {session_id}")]
    Broken { session_id: String },

    #[error("denied: {reason}")]
    PolicyDenied { reason: String },

    /// Canonical path escaped the session workspace. Logged as a security
    /// event at the call site.
    #[error("path outside workspace: {path}")]
    OutOfSandbox { path: String },

    #[error("tool failed: {message}")]
    ToolFailure { message: String },

    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("no available port in {start}..{end}")]
    NoAvailablePort { start: u16, end: u16 },

    #[error("failed to spawn process: {message}")]
    Spawn { message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BuilderError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            BuilderError::Init { .. } => ErrorType::Init,
            BuilderError::SessionNotFound { .. } => ErrorType::SessionNotFound,
            BuilderError::Busy { .. } => ErrorType::Busy,
            BuilderError::Broken { .. } => ErrorType::Broken,
            BuilderError::PolicyDenied { .. } => ErrorType::PolicyDenied,
            BuilderError::OutOfSandbox { .. } => ErrorType::OutOfSandbox,
            BuilderError::ToolFailure { .. } => ErrorType::ToolFailure,
            BuilderError::Timeout { .. } => ErrorType::Timeout,
            BuilderError::NoAvailablePort { .. } => ErrorType::NoAvailablePort,
            BuilderError::Spawn { .. } => ErrorType::Spawn,
            BuilderError::InvalidRequest { .. } => ErrorType::InvalidRequest,
            BuilderError::Io(_) | BuilderError::Json(_) => ErrorType::Internal,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            BuilderError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            BuilderError::Busy { .. } => StatusCode::CONFLICT,
            BuilderError::PolicyDenied { .. } | BuilderError::OutOfSandbox { .. } => {
                StatusCode::FORBIDDEN
            }
            BuilderError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            BuilderError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Problem-details response body, shared by every HTTP error surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    pub error_type: ErrorType,
    pub title: String,
    pub status: u16,
}

impl IntoResponse for BuilderError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ProblemDetails {
            error_type: self.error_type(),
            title: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_types_are_stable_snake_case() {
        let err = BuilderError::OutOfSandbox {
            path: "/etc/passwd".to_string(),
        };
        let body = serde_json::to_value(ProblemDetails {
            error_type: err.error_type(),
            title: err.to_string(),
            status: 403,
        })
        .unwrap();
        assert_eq!(body["error_type"], "out_of_sandbox");
    }

    #[test]
    fn busy_maps_to_conflict() {
        let err = BuilderError::Busy {
            session_id: "s1".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }
}
