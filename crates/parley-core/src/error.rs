// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session error taxonomy

/// Result alias for session runtime operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised by the session runtime
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No registry entry for the requested logical or connection id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Code ran outside any bound context
    #[error("No session context is bound to the current task")]
    ContextUnbound,

    /// The connect reaction rejected the connection; no session was created
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Cooperative stop signal raised at an emitter boundary
    #[error("Task stopped by user")]
    Interrupted,

    /// A registry key is already taken by a different session
    #[error("Session already registered: {0}")]
    AlreadyRegistered(String),

    /// The operation needs a live duplex connection
    #[error("Session {0} has no live connection")]
    NotConnected(String),

    /// The transport could not deliver a frame
    #[error("Transport error: {0}")]
    Transport(String),
}

/// True when `err`, or anything it wraps, is the cooperative stop signal.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(cause.downcast_ref::<SessionError>(), Some(SessionError::Interrupted))
    })
}
