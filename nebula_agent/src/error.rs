//! Errors surfaced by the terminal and process managers and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("maximum sessions reached ({max})")]
    CapacityExceeded { max: usize },
    #[error("session already exists: {0}")]
    DuplicateSession(String),
    #[error("shell not allowed: {0}")]
    ShellNotAllowed(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session closed: {0}")]
    SessionClosed(String),
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),
    #[error("terminal i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl TerminalError {
    pub fn status(&self) -> StatusCode {
        match self {
            TerminalError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TerminalError::DuplicateSession(_) => StatusCode::CONFLICT,
            TerminalError::ShellNotAllowed(_) => StatusCode::FORBIDDEN,
            TerminalError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            TerminalError::SessionClosed(_) => StatusCode::GONE,
            TerminalError::SpawnFailed(_) | TerminalError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for TerminalError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid PID: {0}")]
    InvalidPid(String),
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("cannot kill protected process {0}")]
    Protected(u32),
    #[error("failed to signal process {0}")]
    SignalFailed(u32),
}

impl ProcessError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProcessError::InvalidPid(_) => StatusCode::BAD_REQUEST,
            ProcessError::NotFound(_) => StatusCode::NOT_FOUND,
            ProcessError::Protected(_) => StatusCode::FORBIDDEN,
            ProcessError::SignalFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProcessError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_http_statuses() {
        let cases = [
            (TerminalError::CapacityExceeded { max: 2 }, 503),
            (TerminalError::DuplicateSession("a".into()), 409),
            (TerminalError::ShellNotAllowed("python".into()), 403),
            (TerminalError::SessionNotFound("a".into()), 404),
            (TerminalError::SessionClosed("a".into()), 410),
            (TerminalError::SpawnFailed("boom".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(err.status().as_u16(), code, "{err}");
        }
    }

    #[test]
    fn process_errors_map_to_http_statuses() {
        assert_eq!(ProcessError::InvalidPid("abc".into()).status().as_u16(), 400);
        assert_eq!(ProcessError::NotFound(42).status().as_u16(), 404);
        assert_eq!(ProcessError::Protected(1).status().as_u16(), 403);
        assert_eq!(ProcessError::SignalFailed(42).status().as_u16(), 500);
    }
}
