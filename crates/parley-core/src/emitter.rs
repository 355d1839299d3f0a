// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Outbound half of a session: push events and ask questions

use crate::error::{SessionError, SessionResult};
use crate::message::{AskFileResponse, AskResponse, AskSpec, FileSpec, Message, NEW_MESSAGE_EVENT};
use crate::session::Session;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

pub const ASK_EVENT: &str = "ask";
pub const TASK_START_EVENT: &str = "task_start";
pub const TASK_END_EVENT: &str = "task_end";
pub const ENABLE_FILE_UPLOAD_EVENT: &str = "enable_file_upload";

/// Emitter contract consumed by handler code.
///
/// `push` and `ask_and_wait` are the checked operations: when a stop was
/// requested they clear the flag and fail with [`SessionError::Interrupted`]
/// instead of talking to the client. `signal` carries protocol notices and
/// never observes the flag.
#[async_trait]
pub trait Emitter: Send + Sync {
    fn session(&self) -> &Arc<Session>;

    async fn signal(&self, event: &str, payload: Value) -> SessionResult<()>;

    async fn push(&self, event: &str, payload: Value) -> SessionResult<()>;

    /// Returns `None` when the client did not answer within `timeout`.
    async fn ask_and_wait(&self, payload: Value, timeout: Duration) -> SessionResult<Option<Value>>;

    async fn announce_upload_capability(&self, spec: &FileSpec) -> SessionResult<()> {
        let payload = serde_json::to_value(spec).unwrap_or(Value::Null);
        self.signal(ENABLE_FILE_UPLOAD_EVENT, payload).await
    }

    async fn notify_task_start(&self) -> SessionResult<()> {
        self.signal(TASK_START_EVENT, Value::Null).await
    }

    async fn notify_task_end(&self) -> SessionResult<()> {
        self.signal(TASK_END_EVENT, Value::Null).await
    }

    /// Record the user's message with the persistence backend. The client
    /// already renders its own message, so nothing goes on the wire.
    async fn notify_user_message_received(&self, message: &Message) -> SessionResult<()> {
        let mut message = message.clone();
        message.conversation_id = self.session().conversation_id().await;
        persist(self.session(), &message).await;
        Ok(())
    }

    /// Persist and push a chat message. Observes the stop flag.
    ///
    /// Returns the message id, replaced by the persisted id when the backend
    /// assigns one.
    async fn send_message(&self, message: Message) -> SessionResult<String> {
        if self.session().take_stop() {
            return Err(SessionError::Interrupted);
        }
        self.deliver(message, NEW_MESSAGE_EVENT).await
    }

    /// Persist and send a server-authored message regardless of the stop flag.
    async fn send_notice(&self, message: Message) -> SessionResult<String> {
        self.deliver(message, NEW_MESSAGE_EVENT).await
    }

    async fn deliver(&self, mut message: Message, event: &str) -> SessionResult<String> {
        message.conversation_id = self.session().conversation_id().await;
        if let Some(persisted_id) = persist(self.session(), &message).await {
            message.id = persisted_id;
        }
        let payload = serde_json::to_value(&message).unwrap_or(Value::Null);
        self.signal(event, payload).await?;
        Ok(message.id)
    }

    /// Post `message` as a question and wait for the answer.
    async fn ask(&self, mut message: Message, spec: AskSpec) -> SessionResult<Option<Value>> {
        message.wait_for_answer = true;
        message.conversation_id = self.session().conversation_id().await;

        let mut payload = Map::new();
        payload.insert("msg".into(), serde_json::to_value(&message).unwrap_or(Value::Null));
        payload.insert("spec".into(), serde_json::to_value(&spec).unwrap_or(Value::Null));
        let timeout = Duration::from_secs(spec.timeout);
        self.ask_and_wait(Value::Object(payload), timeout).await
    }

    async fn ask_user(&self, content: &str, timeout: u64) -> SessionResult<Option<AskResponse>> {
        let spec = AskSpec {
            timeout,
            kind: "text".into(),
            file: None,
        };
        let answer = self.ask(Message::new(content), spec).await?;
        Ok(answer.and_then(|value| serde_json::from_value(value).ok()))
    }

    async fn ask_file(
        &self,
        content: &str,
        files: FileSpec,
        timeout: u64,
    ) -> SessionResult<Option<Vec<AskFileResponse>>> {
        let spec = AskSpec {
            timeout,
            kind: "file".into(),
            file: Some(files),
        };
        let answer = self.ask(Message::new(content), spec).await?;
        Ok(answer.and_then(|value| serde_json::from_value(value).ok()))
    }
}

async fn persist(session: &Session, message: &Message) -> Option<String> {
    let client = session.conversation_client()?;
    match client.create_message(message).await {
        Ok(persisted_id) => persisted_id,
        Err(err) => {
            tracing::error!(session_id = %session.id(), error = %err, "Failed to persist message");
            None
        }
    }
}

/// Emitter for live duplex sessions
pub struct DuplexEmitter {
    session: Arc<Session>,
}

impl DuplexEmitter {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    fn check_stop(&self) -> SessionResult<()> {
        if self.session.take_stop() {
            tracing::debug!(session_id = %self.session.id(), "Stop observed at emitter boundary");
            return Err(SessionError::Interrupted);
        }
        Ok(())
    }
}

#[async_trait]
impl Emitter for DuplexEmitter {
    fn session(&self) -> &Arc<Session> {
        &self.session
    }

    async fn signal(&self, event: &str, payload: Value) -> SessionResult<()> {
        let link = self
            .session
            .link()
            .ok_or_else(|| SessionError::NotConnected(self.session.id().to_string()))?;
        link.emit(event, payload).await
    }

    async fn push(&self, event: &str, payload: Value) -> SessionResult<()> {
        self.check_stop()?;
        self.signal(event, payload).await
    }

    async fn ask_and_wait(
        &self,
        payload: Value,
        timeout: Duration,
    ) -> SessionResult<Option<Value>> {
        self.check_stop()?;
        let link = self
            .session
            .link()
            .ok_or_else(|| SessionError::NotConnected(self.session.id().to_string()))?;
        link.call(ASK_EVENT, payload, timeout).await
    }
}

/// Emitter for plain request/response sessions; there is no client to talk to.
pub struct PlainEmitter {
    session: Arc<Session>,
}

impl PlainEmitter {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Emitter for PlainEmitter {
    fn session(&self) -> &Arc<Session> {
        &self.session
    }

    async fn signal(&self, event: &str, _payload: Value) -> SessionResult<()> {
        tracing::trace!(session_id = %self.session.id(), event, "Dropping event for plain session");
        Ok(())
    }

    async fn push(&self, event: &str, payload: Value) -> SessionResult<()> {
        self.signal(event, payload).await
    }

    async fn ask_and_wait(
        &self,
        _payload: Value,
        _timeout: Duration,
    ) -> SessionResult<Option<Value>> {
        Ok(None)
    }
}
