// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The durable per-conversation state

use crate::auth::User;
use crate::error::SessionResult;
use crate::persistence::ConversationClient;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Outbound half of one transport connection.
///
/// A duplex session holds the link of its current connection; restoring the
/// session swaps in the link of the new connection.
#[async_trait]
pub trait ClientLink: Send + Sync {
    /// Fire an event at the client.
    async fn emit(&self, event: &str, payload: Value) -> SessionResult<()>;

    /// Send a request and wait for the client's answer.
    ///
    /// Returns `Ok(None)` when the client did not answer within `timeout`.
    async fn call(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> SessionResult<Option<Value>>;
}

/// Connection-bound state of a live duplex session
pub struct DuplexState {
    connection_id: RwLock<String>,
    link: RwLock<Arc<dyn ClientLink>>,
    should_stop: AtomicBool,
    restored: AtomicBool,
}

/// Which channel a session talks through
pub enum SessionKind {
    /// Request/response interaction without a persistent channel
    Plain,
    /// Live bidirectional connection
    Duplex(DuplexState),
}

impl fmt::Debug for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Plain => f.write_str("Plain"),
            SessionKind::Duplex(state) => f
                .debug_struct("Duplex")
                .field("connection_id", &*state.connection_id.read())
                .field("should_stop", &state.should_stop.load(Ordering::SeqCst))
                .field("restored", &state.restored.load(Ordering::SeqCst))
                .finish(),
        }
    }
}

/// One logical conversation.
///
/// Identity, user environment and kind are fixed at creation. Settings,
/// the stop flag and the conversation id mutate over the session's life.
pub struct Session {
    id: String,
    user: Option<User>,
    token: Option<String>,
    user_env: HashMap<String, String>,
    settings: RwLock<Map<String, Value>>,
    conversation_id: RwLock<Option<String>>,
    conversation_lock: tokio::sync::Mutex<()>,
    client: Option<Arc<dyn ConversationClient>>,
    kind: SessionKind,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn with_kind(id: impl Into<String>, kind: SessionKind) -> Self {
        Self {
            id: id.into(),
            user: None,
            token: None,
            user_env: HashMap::new(),
            settings: RwLock::new(Map::new()),
            conversation_id: RwLock::new(None),
            conversation_lock: tokio::sync::Mutex::new(()),
            client: None,
            kind,
        }
    }

    pub fn duplex(
        id: impl Into<String>,
        connection_id: impl Into<String>,
        link: Arc<dyn ClientLink>,
    ) -> Self {
        Self::with_kind(
            id,
            SessionKind::Duplex(DuplexState {
                connection_id: RwLock::new(connection_id.into()),
                link: RwLock::new(link),
                should_stop: AtomicBool::new(false),
                restored: AtomicBool::new(false),
            }),
        )
    }

    pub fn plain(id: impl Into<String>) -> Self {
        Self::with_kind(id, SessionKind::Plain)
    }

    pub fn with_user(mut self, user: Option<User>) -> Self {
        self.user = user;
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_user_env(mut self, user_env: HashMap<String, String>) -> Self {
        self.user_env = user_env;
        self
    }

    pub fn with_conversation_client(mut self, client: Option<Arc<dyn ConversationClient>>) -> Self {
        self.client = client;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn user_env(&self) -> &HashMap<String, String> {
        &self.user_env
    }

    pub fn kind(&self) -> &SessionKind {
        &self.kind
    }

    pub fn is_duplex(&self) -> bool {
        matches!(self.kind, SessionKind::Duplex(_))
    }

    pub fn settings(&self) -> Map<String, Value> {
        self.settings.read().clone()
    }

    /// Merge `changes` into the settings bag; later keys win.
    pub fn update_settings(&self, changes: &Map<String, Value>) {
        let mut settings = self.settings.write();
        for (key, value) in changes {
            settings.insert(key.clone(), value.clone());
        }
    }

    pub(crate) fn conversation_client(&self) -> Option<&Arc<dyn ConversationClient>> {
        self.client.as_ref()
    }

    fn cached_conversation_id(&self) -> Option<String> {
        self.conversation_id.read().clone()
    }

    /// Id of the persisted conversation, created on first use.
    ///
    /// Concurrent callers create at most one conversation. Returns `None`
    /// without a persistence backend or when creation failed.
    pub async fn conversation_id(&self) -> Option<String> {
        if let Some(id) = self.cached_conversation_id() {
            return Some(id);
        }
        let client = self.client.clone()?;

        let _guard = self.conversation_lock.lock().await;
        if let Some(id) = self.cached_conversation_id() {
            return Some(id);
        }

        let tags = match self.kind {
            SessionKind::Plain => vec!["api".to_string()],
            SessionKind::Duplex(_) => vec!["chat".to_string()],
        };
        let user_id = self.user.as_ref().and_then(|user| user.persisted_id.as_deref());
        match client.create_conversation(user_id, &tags).await {
            Ok(id) => {
                *self.conversation_id.write() = Some(id.clone());
                tracing::debug!(
                    session_id = %self.id,
                    conversation_id = %id,
                    "Created conversation"
                );
                Some(id)
            }
            Err(err) => {
                tracing::error!(
                    session_id = %self.id,
                    error = %err,
                    "Failed to create conversation"
                );
                None
            }
        }
    }

    fn duplex_state(&self) -> Option<&DuplexState> {
        match &self.kind {
            SessionKind::Duplex(state) => Some(state),
            SessionKind::Plain => None,
        }
    }

    /// Current transport connection id; `None` for plain sessions.
    pub fn connection_id(&self) -> Option<String> {
        self.duplex_state().map(|state| state.connection_id.read().clone())
    }

    pub fn link(&self) -> Option<Arc<dyn ClientLink>> {
        self.duplex_state().map(|state| state.link.read().clone())
    }

    pub fn is_restored(&self) -> bool {
        self.duplex_state()
            .is_some_and(|state| state.restored.load(Ordering::SeqCst))
    }

    pub fn should_stop(&self) -> bool {
        self.duplex_state()
            .is_some_and(|state| state.should_stop.load(Ordering::SeqCst))
    }

    pub fn request_stop(&self) {
        if let Some(state) = self.duplex_state() {
            state.should_stop.store(true, Ordering::SeqCst);
        }
    }

    pub fn clear_stop(&self) {
        if let Some(state) = self.duplex_state() {
            state.should_stop.store(false, Ordering::SeqCst);
        }
    }

    /// Observe a pending stop request, clearing it.
    pub fn take_stop(&self) -> bool {
        self.duplex_state()
            .is_some_and(|state| state.should_stop.swap(false, Ordering::SeqCst))
    }

    /// Point the session at a new connection. Returns the previous
    /// connection id.
    pub(crate) fn restore(&self, connection_id: &str, link: Arc<dyn ClientLink>) -> Option<String> {
        let state = self.duplex_state()?;
        let previous =
            std::mem::replace(&mut *state.connection_id.write(), connection_id.to_string());
        *state.link.write() = link;
        state.restored.store(true, Ordering::SeqCst);
        Some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::sync::atomic::AtomicUsize;

    struct NullLink;

    #[async_trait]
    impl ClientLink for NullLink {
        async fn emit(&self, _event: &str, _payload: Value) -> SessionResult<()> {
            Ok(())
        }

        async fn call(
            &self,
            _event: &str,
            _payload: Value,
            _timeout: Duration,
        ) -> SessionResult<Option<Value>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct SlowClient {
        created: AtomicUsize,
        tags: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConversationClient for SlowClient {
        async fn create_conversation(
            &self,
            _user_id: Option<&str>,
            tags: &[String],
        ) -> anyhow::Result<String> {
            tokio::task::yield_now().await;
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            *self.tags.lock() = tags.to_vec();
            Ok(format!("conv-{n}"))
        }

        async fn create_message(&self, _message: &Message) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn settings_merge_overwrites_keys() {
        let session = Session::plain("s-1");
        let mut first = Map::new();
        first.insert("model".into(), Value::from("small"));
        first.insert("temperature".into(), Value::from(0.2));
        session.update_settings(&first);

        let mut second = Map::new();
        second.insert("model".into(), Value::from("large"));
        session.update_settings(&second);

        let settings = session.settings();
        assert_eq!(settings["model"], Value::from("large"));
        assert_eq!(settings["temperature"], Value::from(0.2));
    }

    #[test]
    fn take_stop_clears_the_flag() {
        let session = Session::duplex("s-1", "c-1", Arc::new(NullLink));
        assert!(!session.take_stop());
        session.request_stop();
        assert!(session.should_stop());
        assert!(session.take_stop());
        assert!(!session.should_stop());
    }

    #[test]
    fn plain_sessions_have_no_connection() {
        let session = Session::plain("s-1");
        session.request_stop();
        assert!(!session.should_stop());
        assert!(session.connection_id().is_none());
        assert!(session.link().is_none());
    }

    #[test]
    fn restore_swaps_connection_and_marks_restored() {
        let session = Session::duplex("s-1", "c-1", Arc::new(NullLink));
        assert!(!session.is_restored());
        let previous = session.restore("c-2", Arc::new(NullLink));
        assert_eq!(previous.as_deref(), Some("c-1"));
        assert_eq!(session.connection_id().as_deref(), Some("c-2"));
        assert!(session.is_restored());
    }

    #[tokio::test]
    async fn conversation_is_created_once_under_concurrency() {
        let client = Arc::new(SlowClient::default());
        let session = Arc::new(
            Session::duplex("s-1", "c-1", Arc::new(NullLink))
                .with_conversation_client(Some(client.clone() as Arc<dyn ConversationClient>)),
        );

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.conversation_id().await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().as_deref(), Some("conv-0"));
        }
        assert_eq!(client.created.load(Ordering::SeqCst), 1);
        assert_eq!(*client.tags.lock(), vec!["chat".to_string()]);
    }

    #[tokio::test]
    async fn no_backend_means_no_conversation() {
        assert!(Session::plain("s-1").conversation_id().await.is_none());
    }
}
