// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Server error types and handling

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use parley_core::SessionError;
use serde::{Deserialize, Serialize};

/// Server result type
pub type ServerResult<T> = Result<T, ServerError>;

/// Problem+JSON body returned for failed requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
}

/// Server error types
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Too many connections")]
    RateLimited,
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Auth(_) => StatusCode::UNAUTHORIZED,
            ServerError::ConnectionRefused(_) => StatusCode::FORBIDDEN,
            ServerError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Config(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Convert error to Problem+JSON body
    pub fn to_problem(&self) -> ProblemDetails {
        let (slug, title) = match self {
            ServerError::Auth(_) => ("auth", "Authentication Failed"),
            ServerError::ConnectionRefused(_) => ("connection-refused", "Connection Refused"),
            ServerError::SessionNotFound(_) => ("not-found", "Session Not Found"),
            ServerError::BadRequest(_) => ("bad-request", "Bad Request"),
            ServerError::Config(_) => ("config", "Configuration Error"),
            ServerError::Internal(_) => ("internal", "Internal Server Error"),
            ServerError::RateLimited => ("rate-limited", "Too Many Connections"),
        };
        let detail = match self {
            ServerError::Auth(msg)
            | ServerError::ConnectionRefused(msg)
            | ServerError::BadRequest(msg)
            | ServerError::Config(msg)
            | ServerError::Internal(msg) => msg.clone(),
            ServerError::SessionNotFound(id) => format!("Session with ID '{id}' not found"),
            ServerError::RateLimited => "Connection limit reached".to_string(),
        };
        ProblemDetails {
            problem_type: format!("about:blank#{slug}"),
            title: title.to_string(),
            status: self.status().as_u16(),
            detail,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_problem())).into_response()
    }
}

impl From<SessionError> for ServerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::ConnectionRefused(msg) => ServerError::ConnectionRefused(msg),
            SessionError::SessionNotFound(id) => ServerError::SessionNotFound(id),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

/// Convert any error to ServerError
impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::Internal(err.to_string())
    }
}

/// Convert IO errors
impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Internal(format!("IO error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_map_to_forbidden() {
        let refusal =
            SessionError::ConnectionRefused("Missing user environment variable: API_KEY".into());
        let err: ServerError = refusal.into();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        let problem = err.to_problem();
        assert_eq!(problem.status, 403);
        assert_eq!(problem.detail, "Missing user environment variable: API_KEY");
    }

    #[test]
    fn rate_limit_is_429() {
        assert_eq!(ServerError::RateLimited.to_problem().status, 429);
    }
}
