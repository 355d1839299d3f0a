// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Task-scoped context carrier
//!
//! Every reaction runs inside [`Context::scope`], which binds the session and
//! its emitter to the current tokio task. Nested code reaches them through
//! [`current`] without threading a parameter. Tasks spawned from inside a
//! scope do not inherit it; they have to bind their own.

use crate::auth::User;
use crate::emitter::{DuplexEmitter, Emitter, PlainEmitter};
use crate::error::{SessionError, SessionResult};
use crate::session::{Session, SessionKind};
use crate::user_session::UserSessionStore;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT: Context;
}

#[derive(Clone)]
pub struct Context {
    session: Arc<Session>,
    emitter: Arc<dyn Emitter>,
    user_sessions: Arc<UserSessionStore>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("session", &self.session).finish_non_exhaustive()
    }
}

impl Context {
    /// Build a context for `session`, choosing the emitter by session kind.
    pub fn new(session: Arc<Session>, user_sessions: Arc<UserSessionStore>) -> Self {
        let emitter: Arc<dyn Emitter> = match session.kind() {
            SessionKind::Duplex(_) => Arc::new(DuplexEmitter::new(session.clone())),
            SessionKind::Plain => Arc::new(PlainEmitter::new(session.clone())),
        };
        Self {
            session,
            emitter,
            user_sessions,
        }
    }

    /// Context over a fresh plain session with a random id, for
    /// request/response work.
    pub fn plain(
        user: Option<User>,
        token: Option<String>,
        user_env: HashMap<String, String>,
    ) -> Self {
        let session = Session::plain(uuid::Uuid::new_v4().to_string())
            .with_user(user)
            .with_token(token)
            .with_user_env(user_env);
        Self::new(Arc::new(session), Arc::new(UserSessionStore::new()))
    }

    pub fn with_user_sessions(mut self, user_sessions: Arc<UserSessionStore>) -> Self {
        self.user_sessions = user_sessions;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn emitter(&self) -> &Arc<dyn Emitter> {
        &self.emitter
    }

    pub fn user_sessions(&self) -> &Arc<UserSessionStore> {
        &self.user_sessions
    }

    /// Read a value from the bound session's ancillary store.
    pub fn user_value(&self, key: &str) -> Option<Value> {
        self.user_sessions.get(self.session.id(), key)
    }

    pub fn set_user_value(&self, key: impl Into<String>, value: Value) {
        self.user_sessions.set(self.session.id(), key, value);
    }

    pub fn user_state(&self) -> Map<String, Value> {
        self.user_sessions
            .get_session(self.session.id())
            .unwrap_or_default()
    }

    /// Run `fut` with this context bound.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }
}

/// The context bound to the calling task.
pub fn current() -> SessionResult<Context> {
    CURRENT
        .try_with(Context::clone)
        .map_err(|_| SessionError::ContextUnbound)
}

/// Like [`current`], for callers that treat "no session" as a normal state.
pub fn try_current() -> Option<Context> {
    CURRENT.try_with(Context::clone).ok()
}
