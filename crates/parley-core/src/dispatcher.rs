// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol state machine reacting to inbound transport events
//!
//! Each reaction resolves the session, binds a [`Context`] for its duration
//! and invokes the configured [`Hooks`]. Message processing reports handler
//! failures to the client; every other reaction lets them propagate to
//! [`Dispatcher::dispatch`], which only logs them.

use crate::auth::Authenticator;
use crate::config::ProjectConfig;
use crate::context::Context;
use crate::emitter::Emitter;
use crate::error::{SessionError, SessionResult, is_interrupted};
use crate::event::InboundEvent;
use crate::hooks::Hooks;
use crate::message::{Action, Message};
use crate::persistence::ConversationClient;
use crate::registry::SessionRegistry;
use crate::session::{ClientLink, Session};
use crate::user_session::UserSessionStore;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Notice sent to the client when a stop request arrives.
pub const STOP_NOTICE: &str = "Task stopped by the user.";

/// Metadata presented by a connecting client
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub connection_id: String,
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
    /// Logical session id from a previous connection
    pub session_id: Option<String>,
    /// JSON object with the user's environment variables
    pub user_env: Option<String>,
}

/// Accepted connection
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Fresh(Arc<Session>),
    Restored(Arc<Session>),
}

impl ConnectOutcome {
    pub fn session(&self) -> &Arc<Session> {
        match self {
            ConnectOutcome::Fresh(session) | ConnectOutcome::Restored(session) => session,
        }
    }

    pub fn is_restored(&self) -> bool {
        matches!(self, ConnectOutcome::Restored(_))
    }
}

struct Inner {
    config: ProjectConfig,
    hooks: Hooks,
    authenticator: Option<Arc<dyn Authenticator>>,
    conversation_client: Option<Arc<dyn ConversationClient>>,
    registry: SessionRegistry,
    user_sessions: Arc<UserSessionStore>,
    /// Pending grace-period timers keyed by the connection that scheduled them
    expiries: Mutex<HashMap<String, AbortHandle>>,
}

/// Event dispatcher. Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

pub struct DispatcherBuilder {
    config: ProjectConfig,
    hooks: Hooks,
    authenticator: Option<Arc<dyn Authenticator>>,
    conversation_client: Option<Arc<dyn ConversationClient>>,
    user_sessions: Option<Arc<UserSessionStore>>,
}

impl DispatcherBuilder {
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn conversation_client(mut self, client: Arc<dyn ConversationClient>) -> Self {
        self.conversation_client = Some(client);
        self
    }

    pub fn user_sessions(mut self, store: Arc<UserSessionStore>) -> Self {
        self.user_sessions = Some(store);
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                config: self.config,
                hooks: self.hooks,
                authenticator: self.authenticator,
                conversation_client: self.conversation_client,
                registry: SessionRegistry::new(),
                user_sessions: self.user_sessions.unwrap_or_default(),
                expiries: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Dispatcher {
    pub fn builder(config: ProjectConfig) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            hooks: Hooks::default(),
            authenticator: None,
            conversation_client: None,
            user_sessions: None,
        }
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.inner.config
    }

    pub fn hooks(&self) -> &Hooks {
        &self.inner.hooks
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn user_sessions(&self) -> &Arc<UserSessionStore> {
        &self.inner.user_sessions
    }

    /// Number of grace-period timers still waiting to fire.
    pub fn pending_expiries(&self) -> usize {
        self.inner.expiries.lock().len()
    }

    fn context(&self, session: &Arc<Session>) -> Context {
        Context::new(session.clone(), self.inner.user_sessions.clone())
    }

    /// Context over a fresh plain session for request/response work.
    pub fn plain_context(
        &self,
        user: Option<crate::auth::User>,
        token: Option<String>,
        user_env: HashMap<String, String>,
    ) -> Context {
        let session = Session::plain(uuid::Uuid::new_v4().to_string())
            .with_user(user)
            .with_token(token)
            .with_user_env(user_env)
            .with_conversation_client(self.inner.conversation_client.clone());
        self.context(&Arc::new(session))
    }

    /// Accept or refuse a connection.
    ///
    /// A known `session_id` restores that session onto the new connection;
    /// otherwise the user environment is validated and a new session is
    /// registered.
    pub async fn connect(
        &self,
        request: ConnectRequest,
        link: Arc<dyn ClientLink>,
    ) -> SessionResult<ConnectOutcome> {
        let inner = &self.inner;
        if !inner.hooks.serves_chat() {
            warn!(
                connection_id = %request.connection_id,
                "Refusing connection without a chat handler"
            );
            return Err(SessionError::ConnectionRefused(
                "No websocket endpoint configured".into(),
            ));
        }

        let user = if inner.config.require_login {
            let authenticator = inner.authenticator.as_ref().ok_or_else(|| {
                SessionError::ConnectionRefused(
                    "Login is required but no authenticator is configured".into(),
                )
            })?;
            match authenticator.authenticate(request.authorization.as_deref()).await {
                Ok(user) => Some(user),
                Err(err) => {
                    warn!(
                        connection_id = %request.connection_id,
                        error = %err,
                        "Authentication failed"
                    );
                    return Err(SessionError::ConnectionRefused(
                        "Authentication failed".into(),
                    ));
                }
            }
        } else {
            None
        };

        if let Some(session) = request
            .session_id
            .as_deref()
            .and_then(|id| inner.registry.lookup_by_id(id))
        {
            let previous = session.connection_id();
            inner.registry.rebind(&session, &request.connection_id, link)?;
            if let Some(previous) = previous {
                self.cancel_expiry(&previous);
            }
            info!(
                session_id = %session.id(),
                connection_id = %request.connection_id,
                "Restored session"
            );
            return Ok(ConnectOutcome::Restored(session));
        }

        let user_env = inner.config.load_user_env(request.user_env.as_deref())?;
        let session_id = request
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session = Arc::new(
            Session::duplex(session_id, request.connection_id.clone(), link)
                .with_user(user)
                .with_token(request.authorization)
                .with_user_env(user_env)
                .with_conversation_client(inner.conversation_client.clone()),
        );
        inner.registry.create(session.clone())?;
        info!(
            session_id = %session.id(),
            connection_id = %request.connection_id,
            "Created session"
        );
        Ok(ConnectOutcome::Fresh(session))
    }

    /// Route one inbound event to its reaction, logging any failure.
    pub async fn dispatch(&self, connection_id: &str, event: InboundEvent) {
        let name = event.name();
        debug!(connection_id, event = name, "Dispatching event");
        let result = match event {
            InboundEvent::ConnectionSuccessful => self.connection_successful(connection_id).await,
            InboundEvent::UiMessage(message) => self.ui_message(connection_id, message).await,
            InboundEvent::Stop => self.stop(connection_id).await,
            InboundEvent::ClearSession => self.clear_session(connection_id).await,
            InboundEvent::Disconnect => self.disconnect(connection_id).await.map(|_| ()),
            InboundEvent::ActionCall(action) => self.action_call(connection_id, action).await,
            InboundEvent::ChatSettingsChange(settings) => {
                self.settings_change(connection_id, settings).await
            }
            InboundEvent::FileUpload(files) => self.file_upload(connection_id, files).await,
        };
        if let Err(err) = result {
            error!(connection_id, event = name, error = %format!("{err:#}"), "Reaction failed");
        }
    }

    /// Announce uploads and start the chat for a fresh session.
    pub async fn connection_successful(&self, connection_id: &str) -> anyhow::Result<()> {
        let session = self.inner.registry.require_by_connection(connection_id)?;
        if session.is_restored() {
            return Ok(());
        }

        let ctx = self.context(&session);
        let emitter = ctx.emitter().clone();
        let hooks = &self.inner.hooks;
        ctx.scope(async move {
            if let Some(spec) = hooks.upload_spec() {
                emitter.announce_upload_capability(spec).await?;
            }
            if let Some(chat_start) = &hooks.chat_start {
                chat_start().await?;
            }
            anyhow::Ok(())
        })
        .await
    }

    pub async fn ui_message(&self, connection_id: &str, message: Message) -> anyhow::Result<()> {
        let session = self.inner.registry.require_by_connection(connection_id)?;
        session.clear_stop();

        let ctx = self.context(&session);
        let emitter = ctx.emitter().clone();
        ctx.scope(self.process_message(emitter, message)).await;
        Ok(())
    }

    async fn process_message(&self, emitter: Arc<dyn Emitter>, message: Message) {
        let session_id = emitter.session().id().to_string();
        let outcome = AssertUnwindSafe(self.run_message_hook(emitter.as_ref(), message))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(handler_panic(payload)));
        match outcome {
            Ok(()) => {}
            Err(err) if is_interrupted(&err) => {
                debug!(%session_id, "Message processing interrupted");
            }
            Err(err) => {
                error!(%session_id, error = %format!("{err:#}"), "Message handler failed");
                let notice = Message::error(error_content(&err));
                if let Err(send_err) = emitter.send_notice(notice).await {
                    warn!(%session_id, error = %send_err, "Failed to report handler error");
                }
            }
        }
        if let Err(err) = emitter.notify_task_end().await {
            warn!(%session_id, error = %err, "Failed to signal task end");
        }
    }

    async fn run_message_hook(
        &self,
        emitter: &dyn Emitter,
        message: Message,
    ) -> anyhow::Result<()> {
        emitter.notify_task_start().await?;
        if let Some(on_message) = &self.inner.hooks.message {
            emitter.notify_user_message_received(&message).await?;
            on_message(message.content.trim().to_string(), message.id).await?;
        }
        Ok(())
    }

    /// Send the stop notice and raise the session's stop flag.
    pub async fn stop(&self, connection_id: &str) -> anyhow::Result<()> {
        let Some(session) = self.inner.registry.lookup_by_connection(connection_id) else {
            return Ok(());
        };

        let ctx = self.context(&session);
        let emitter = ctx.emitter().clone();
        let stop = self.inner.hooks.stop.clone();
        ctx.scope(async move {
            if let Err(err) = emitter.send_notice(Message::system(STOP_NOTICE)).await {
                warn!(session_id = %session.id(), error = %err, "Failed to send stop notice");
            }
            session.request_stop();
            info!(session_id = %session.id(), "Stop requested");
            if let Some(stop) = stop {
                stop().await?;
            }
            anyhow::Ok(())
        })
        .await
    }

    /// Run the chat-end hook and tear the session down.
    pub async fn clear_session(&self, connection_id: &str) -> anyhow::Result<()> {
        let Some(session) = self.inner.registry.lookup_by_connection(connection_id) else {
            return Ok(());
        };

        let result = match self.inner.hooks.chat_end.clone() {
            Some(chat_end) => self.context(&session).scope(chat_end()).await,
            None => Ok(()),
        };
        self.teardown(&session);
        result
    }

    /// Run the chat-end hook and schedule teardown after the grace period.
    ///
    /// The scheduled cleanup is keyed to `connection_id`. Restoring the
    /// session onto another connection cancels it.
    pub async fn disconnect(&self, connection_id: &str) -> anyhow::Result<Option<JoinHandle<()>>> {
        let Some(session) = self.inner.registry.lookup_by_connection(connection_id) else {
            return Ok(None);
        };

        if let Some(chat_end) = self.inner.hooks.chat_end.clone() {
            if let Err(err) = self.context(&session).scope(chat_end()).await {
                error!(
                    session_id = %session.id(),
                    error = %format!("{err:#}"),
                    "Chat end hook failed"
                );
            }
        }

        let grace = self.inner.config.session_timeout();
        debug!(session_id = %session.id(), connection_id, ?grace, "Scheduling session expiry");
        let dispatcher = self.clone();
        let expiring = connection_id.to_string();
        let handle = {
            let mut expiries = self.inner.expiries.lock();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                dispatcher.inner.expiries.lock().remove(&expiring);
                if let Some(session) = dispatcher.inner.registry.expire_connection(&expiring) {
                    dispatcher.inner.user_sessions.remove_session(session.id());
                    info!(session_id = %session.id(), connection_id = %expiring, "Session expired");
                }
            });
            let abort = handle.abort_handle();
            if let Some(previous) = expiries.insert(connection_id.to_string(), abort) {
                previous.abort();
            }
            handle
        };
        Ok(Some(handle))
    }

    fn cancel_expiry(&self, connection_id: &str) {
        if let Some(expiry) = self.inner.expiries.lock().remove(connection_id) {
            expiry.abort();
            debug!(connection_id, "Cancelled session expiry");
        }
    }

    fn teardown(&self, session: &Arc<Session>) {
        self.inner.user_sessions.remove_session(session.id());
        if self.inner.registry.delete(session) {
            info!(session_id = %session.id(), "Session cleared");
        }
    }

    /// Merge settings into the session and notify the settings hook.
    pub async fn settings_change(
        &self,
        connection_id: &str,
        settings: Map<String, Value>,
    ) -> anyhow::Result<()> {
        let session = self.inner.registry.require_by_connection(connection_id)?;
        let settings_update = self.inner.hooks.settings_update.clone();
        self.context(&session)
            .scope(async move {
                session.update_settings(&settings);
                if let Some(settings_update) = settings_update {
                    settings_update(settings).await?;
                }
                anyhow::Ok(())
            })
            .await
    }

    pub async fn action_call(&self, connection_id: &str, action: Action) -> anyhow::Result<()> {
        let session = self.inner.registry.require_by_connection(connection_id)?;
        match self.inner.hooks.action_hook(&action.name) {
            Some(callback) => self.context(&session).scope(callback(action)).await,
            None => {
                warn!(session_id = %session.id(), "No callback found for action {}", action.name);
                Ok(())
            }
        }
    }

    pub async fn file_upload(&self, connection_id: &str, files: Value) -> anyhow::Result<()> {
        let session = self.inner.registry.require_by_connection(connection_id)?;
        match &self.inner.hooks.file_upload {
            Some((_, on_upload)) => self.context(&session).scope(on_upload(files)).await,
            None => Ok(()),
        }
    }
}

/// Turn a panic escaping the message hook into a handler error.
fn handler_panic(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    anyhow::anyhow!("Message handler panicked: {detail}")
}

/// First non-empty message in the error chain, or a generic label.
fn error_content(err: &anyhow::Error) -> String {
    err.chain()
        .map(|cause| cause.to_string())
        .find(|text| !text.trim().is_empty())
        .unwrap_or_else(|| "Error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::User;
    use crate::context;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingLink {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingLink {
        fn names(&self) -> Vec<String> {
            self.events.lock().iter().map(|(name, _)| name.clone()).collect()
        }
    }

    #[async_trait]
    impl ClientLink for RecordingLink {
        async fn emit(&self, event: &str, payload: Value) -> SessionResult<()> {
            self.events.lock().push((event.to_string(), payload));
            Ok(())
        }

        async fn call(
            &self,
            event: &str,
            payload: Value,
            _timeout: Duration,
        ) -> SessionResult<Option<Value>> {
            self.events.lock().push((event.to_string(), payload));
            Ok(None)
        }
    }

    struct StaticAuth;

    #[async_trait]
    impl Authenticator for StaticAuth {
        async fn authenticate(&self, authorization: Option<&str>) -> anyhow::Result<User> {
            match authorization {
                Some("Bearer good") => Ok(User::new("alice")),
                _ => anyhow::bail!("bad token"),
            }
        }
    }

    fn echo_hooks() -> Hooks {
        Hooks::new().on_message(|content, _id| async move {
            Message::new(format!("echo: {content}")).send().await?;
            anyhow::Ok(())
        })
    }

    fn request(connection_id: &str, session_id: Option<&str>) -> ConnectRequest {
        ConnectRequest {
            connection_id: connection_id.into(),
            session_id: session_id.map(str::to_string),
            ..ConnectRequest::default()
        }
    }

    #[tokio::test]
    async fn refuses_without_chat_hooks() {
        let dispatcher = Dispatcher::builder(ProjectConfig::default()).build();
        let err = dispatcher
            .connect(request("c-1", None), Arc::new(RecordingLink::default()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::ConnectionRefused("No websocket endpoint configured".into())
        );
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn login_required_resolves_identity() {
        let config = ProjectConfig {
            require_login: true,
            ..ProjectConfig::default()
        };
        let dispatcher = Dispatcher::builder(config)
            .hooks(echo_hooks())
            .authenticator(Arc::new(StaticAuth))
            .build();

        let mut bad = request("c-1", None);
        bad.authorization = Some("Bearer bad".into());
        assert!(matches!(
            dispatcher.connect(bad, Arc::new(RecordingLink::default())).await,
            Err(SessionError::ConnectionRefused(_))
        ));
        assert!(dispatcher.registry().is_empty());

        let mut good = request("c-2", None);
        good.authorization = Some("Bearer good".into());
        let outcome = dispatcher
            .connect(good, Arc::new(RecordingLink::default()))
            .await
            .unwrap();
        let session = outcome.session();
        assert_eq!(session.user().map(|u| u.identifier.as_str()), Some("alice"));
        assert_eq!(session.token(), Some("Bearer good"));
    }

    #[tokio::test]
    async fn missing_session_id_gets_a_fresh_one() {
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(echo_hooks())
            .build();
        let outcome = dispatcher
            .connect(request("c-1", None), Arc::new(RecordingLink::default()))
            .await
            .unwrap();
        assert!(!outcome.is_restored());
        assert!(uuid::Uuid::parse_str(outcome.session().id()).is_ok());
    }

    #[tokio::test]
    async fn message_round_trip_is_framed_by_task_signals() {
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(echo_hooks())
            .build();
        let link = Arc::new(RecordingLink::default());
        dispatcher
            .connect(request("c-1", Some("s-1")), link.clone())
            .await
            .unwrap();

        let message = Message::new("  hello  ").with_author("User");
        dispatcher.ui_message("c-1", message).await.unwrap();

        assert_eq!(link.names(), vec!["task_start", "new_message", "task_end"]);
        assert_eq!(link.events.lock()[1].1["content"], json!("echo: hello"));
    }

    #[tokio::test]
    async fn handler_errors_reach_the_client() {
        let hooks = Hooks::new().on_message(|_, _| async { anyhow::bail!("model unavailable") });
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(hooks)
            .build();
        let link = Arc::new(RecordingLink::default());
        dispatcher
            .connect(request("c-1", Some("s-1")), link.clone())
            .await
            .unwrap();

        dispatcher.ui_message("c-1", Message::new("hi")).await.unwrap();

        assert_eq!(link.names(), vec!["task_start", "new_message", "task_end"]);
        let error = &link.events.lock()[1].1;
        assert_eq!(error["isError"], json!(true));
        assert_eq!(error["content"], json!("model unavailable"));
    }

    #[tokio::test]
    async fn empty_handler_error_still_has_content() {
        let hooks = Hooks::new().on_message(|_, _| async { Err(anyhow::anyhow!("")) });
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(hooks)
            .build();
        let link = Arc::new(RecordingLink::default());
        dispatcher
            .connect(request("c-1", Some("s-1")), link.clone())
            .await
            .unwrap();

        dispatcher.ui_message("c-1", Message::new("hi")).await.unwrap();

        assert_eq!(link.names(), vec!["task_start", "new_message", "task_end"]);
        assert_eq!(link.events.lock()[1].1["content"], json!("Error"));
    }

    #[test]
    fn error_content_skips_empty_context() {
        let err = Err::<(), _>(anyhow::anyhow!("disk full"))
            .map_err(|err| err.context(""))
            .unwrap_err();
        assert_eq!(error_content(&err), "disk full");
        assert_eq!(error_content(&anyhow::anyhow!("  ")), "Error");
    }

    #[tokio::test]
    async fn panicking_handler_still_ends_the_task() {
        let hooks = Hooks::new().on_message(|_, _| async {
            let values: Vec<usize> = Vec::new();
            Message::new(format!("{}", values[3])).send().await?;
            anyhow::Ok(())
        });
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(hooks)
            .build();
        let link = Arc::new(RecordingLink::default());
        dispatcher
            .connect(request("c-1", Some("s-1")), link.clone())
            .await
            .unwrap();

        let reaction = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let message = InboundEvent::UiMessage(Message::new("go"));
                dispatcher.dispatch("c-1", message).await;
            })
        };
        reaction.await.unwrap();

        assert_eq!(link.names(), vec!["task_start", "new_message", "task_end"]);
        let error = link.events.lock()[1].1.clone();
        assert_eq!(error["isError"], json!(true));
        let content = error["content"].as_str().unwrap_or_default();
        assert!(content.starts_with("Message handler panicked"));
        assert!(content.contains("index out of bounds"));
    }

    #[tokio::test]
    async fn stop_sends_notice_and_raises_flag() {
        let stopped = Arc::new(Mutex::new(false));
        let flag = stopped.clone();
        let hooks = echo_hooks().on_stop(move || {
            let flag = flag.clone();
            async move {
                *flag.lock() = true;
                Ok(())
            }
        });
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(hooks)
            .build();
        let link = Arc::new(RecordingLink::default());
        let session = dispatcher
            .connect(request("c-1", Some("s-1")), link.clone())
            .await
            .unwrap()
            .session()
            .clone();

        dispatcher.stop("c-1").await.unwrap();

        assert!(session.should_stop());
        assert!(*stopped.lock());
        let events = link.events.lock();
        assert_eq!(events[0].0, "new_message");
        assert_eq!(events[0].1["content"], json!(STOP_NOTICE));
        assert_eq!(events[0].1["author"], json!("System"));
    }

    #[tokio::test]
    async fn settings_are_merged_before_the_hook_runs() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let hooks = echo_hooks().on_settings_update(move |settings| {
            let sink = sink.clone();
            async move {
                let merged = context::current()?.session().settings();
                *sink.lock() = Some((settings, merged));
                anyhow::Ok(())
            }
        });
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(hooks)
            .build();
        dispatcher
            .connect(request("c-1", Some("s-1")), Arc::new(RecordingLink::default()))
            .await
            .unwrap();

        let mut first = Map::new();
        first.insert("model".into(), json!("small"));
        first.insert("stream".into(), json!(true));
        dispatcher.settings_change("c-1", first).await.unwrap();
        let mut second = Map::new();
        second.insert("model".into(), json!("large"));
        dispatcher
            .settings_change("c-1", second.clone())
            .await
            .unwrap();

        let (incoming, merged) = seen.lock().clone().unwrap();
        assert_eq!(incoming, second);
        assert_eq!(merged["model"], json!("large"));
        assert_eq!(merged["stream"], json!(true));
    }

    #[tokio::test]
    async fn clear_session_tears_down_even_when_chat_end_fails() {
        let hooks = echo_hooks().on_chat_end(|| async { anyhow::bail!("flush failed") });
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(hooks)
            .build();
        dispatcher
            .connect(request("c-1", Some("s-1")), Arc::new(RecordingLink::default()))
            .await
            .unwrap();
        dispatcher.user_sessions().set("s-1", "k", json!(1));

        assert!(dispatcher.clear_session("c-1").await.is_err());
        assert!(dispatcher.registry().lookup_by_id("s-1").is_none());
        assert!(dispatcher.user_sessions().get_session("s-1").is_none());
    }

    #[tokio::test]
    async fn uploads_are_ignored_without_a_handler() {
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(echo_hooks())
            .build();
        dispatcher
            .connect(request("c-1", Some("s-1")), Arc::new(RecordingLink::default()))
            .await
            .unwrap();
        dispatcher
            .file_upload("c-1", json!([{"name": "a.txt"}]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reactions_on_unknown_connections_fail_distinctly() {
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(echo_hooks())
            .build();
        let err = dispatcher
            .ui_message("nope", Message::new("hi"))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessionError>(),
            Some(&SessionError::SessionNotFound("nope".into()))
        );
        dispatcher.stop("nope").await.unwrap();
        assert!(dispatcher.disconnect("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plain_context_has_no_channel() {
        let dispatcher = Dispatcher::builder(ProjectConfig::default()).build();
        let ctx = dispatcher.plain_context(None, None, HashMap::new());
        assert!(!ctx.session().is_duplex());
        let answer = ctx
            .scope(async { crate::AskUser::new("anyone?").send().await })
            .await
            .unwrap();
        assert!(answer.is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_action_is_logged_not_fatal() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let hooks = echo_hooks().action("approve", move |action: Action| {
            let sink = sink.clone();
            async move {
                sink.lock().push(action.value);
                anyhow::Ok(())
            }
        });
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(hooks)
            .build();
        dispatcher
            .connect(request("c-1", Some("s-1")), Arc::new(RecordingLink::default()))
            .await
            .unwrap();

        let missing: Action =
            serde_json::from_value(json!({"name": "retired", "value": "x"})).unwrap();
        dispatcher
            .dispatch("c-1", InboundEvent::ActionCall(missing))
            .await;
        assert!(logs_contain("No callback found for action retired"));

        let approve: Action =
            serde_json::from_value(json!({"name": "approve", "value": "yes"})).unwrap();
        dispatcher
            .dispatch("c-1", InboundEvent::ActionCall(approve))
            .await;
        assert_eq!(*calls.lock(), vec!["yes".to_string()]);
    }

    #[tokio::test]
    #[traced_test]
    async fn reaction_failures_are_logged_at_the_boundary() {
        let hooks =
            echo_hooks().on_settings_update(|_| async { anyhow::bail!("settings rejected") });
        let dispatcher = Dispatcher::builder(ProjectConfig::default())
            .hooks(hooks)
            .build();
        let link = Arc::new(RecordingLink::default());
        dispatcher
            .connect(request("c-1", Some("s-1")), link.clone())
            .await
            .unwrap();

        dispatcher
            .dispatch("c-1", InboundEvent::ChatSettingsChange(Map::new()))
            .await;

        assert!(logs_contain("Reaction failed"));
        assert!(logs_contain("settings rejected"));
        assert!(link.events.lock().is_empty());
    }
}
