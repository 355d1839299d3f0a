// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Chat message, action and ask payloads
//!
//! [`Message::send`], [`AskUser::send`] and [`AskFile::send`] resolve the
//! session through the task-bound [`Context`](crate::Context), so handler
//! code never threads a session handle around.

use crate::context;
use crate::emitter::Emitter;
use crate::error::SessionResult;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Author used for messages that don't set one.
pub const DEFAULT_AUTHOR: &str = "Assistant";

/// Outbound event carrying a chat message.
pub const NEW_MESSAGE_EVENT: &str = "new_message";

/// A chat message as exchanged with the client UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default = "new_id")]
    pub id: String,

    #[serde(default = "now")]
    pub created_at: String,

    #[serde(default)]
    pub content: String,

    #[serde(default = "default_author")]
    pub author: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(default)]
    pub indent: u32,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wait_for_answer: bool,

    #[serde(default)]
    pub disable_human_feedback: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn default_author() -> String {
    DEFAULT_AUTHOR.to_string()
}

impl Message {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            created_at: now(),
            content: content.into(),
            author: default_author(),
            language: None,
            parent_id: None,
            indent: 0,
            is_error: false,
            wait_for_answer: false,
            disable_human_feedback: false,
            conversation_id: None,
        }
    }

    /// Message rendering structured content as indented JSON.
    pub fn json(content: &Value) -> Self {
        let rendered =
            serde_json::to_string_pretty(content).unwrap_or_else(|_| content.to_string());
        Self::new(rendered).with_language("json")
    }

    /// Server-authored error message.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(content).with_author("Error")
        }
    }

    /// Notice authored by the system rather than the assistant.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(content).with_author("System")
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Send the message to the client of the bound session.
    ///
    /// Returns the message id, which is replaced by the persisted id when the
    /// persistence backend assigns one. Fails with
    /// [`SessionError::Interrupted`](crate::SessionError::Interrupted) when a
    /// stop was requested.
    pub async fn send(self) -> SessionResult<String> {
        context::current()?.emitter().send_message(self).await
    }
}

/// A UI action button invoked by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub name: String,

    #[serde(default)]
    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// File constraints announced with the upload capability or an ask-file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    pub accept: Value,
    pub max_files: u32,
    pub max_size_mb: u32,
}

impl FileSpec {
    pub fn new(accept: &[&str]) -> Self {
        Self {
            accept: json!(accept),
            max_files: 1,
            max_size_mb: 2,
        }
    }

    pub fn accept_map(accept: HashMap<String, Vec<String>>) -> Self {
        Self {
            accept: json!(accept),
            max_files: 1,
            max_size_mb: 2,
        }
    }
}

/// How long the client has to answer and what kind of answer is expected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskSpec {
    pub timeout: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub file: Option<FileSpec>,
}

/// A text answer to an ask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskResponse {
    pub content: String,
    #[serde(default)]
    pub author: String,
}

/// A file returned by an ask-file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskFileResponse {
    pub name: String,
    #[serde(default)]
    pub path: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime: String,
    #[serde(default)]
    pub content: Vec<u8>,
}

/// Ask the user for a text answer before continuing
#[derive(Debug, Clone)]
pub struct AskUser {
    message: Message,
    timeout: u64,
}

impl AskUser {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            message: Message::new(content),
            timeout: 60,
        }
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.message.author = author.into();
        self
    }

    /// Returns `None` when the client did not answer in time.
    pub async fn send(self) -> SessionResult<Option<AskResponse>> {
        let spec = AskSpec {
            timeout: self.timeout,
            kind: "text".into(),
            file: None,
        };
        let answer = context::current()?.emitter().ask(self.message, spec).await?;
        Ok(answer.and_then(|value| serde_json::from_value(value).ok()))
    }
}

/// Ask the user to upload files before continuing
#[derive(Debug, Clone)]
pub struct AskFile {
    message: Message,
    spec: FileSpec,
    timeout: u64,
}

impl AskFile {
    pub fn new(content: impl Into<String>, spec: FileSpec) -> Self {
        Self {
            message: Message::new(content),
            spec,
            timeout: 90,
        }
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub async fn send(self) -> SessionResult<Option<Vec<AskFileResponse>>> {
        let spec = AskSpec {
            timeout: self.timeout,
            kind: "file".into(),
            file: Some(self.spec),
        };
        let answer = context::current()?.emitter().ask(self.message, spec).await?;
        Ok(answer.and_then(|value| serde_json::from_value(value).ok()))
    }
}
