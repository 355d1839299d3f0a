// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! User supplied callbacks driven by the dispatcher

use crate::message::{Action, FileSpec};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub type HookFuture = BoxFuture<'static, anyhow::Result<()>>;

type Hook = Arc<dyn Fn() -> HookFuture + Send + Sync>;
type MessageHook = Arc<dyn Fn(String, String) -> HookFuture + Send + Sync>;
type SettingsHook = Arc<dyn Fn(Map<String, Value>) -> HookFuture + Send + Sync>;
type ValueHook = Arc<dyn Fn(Value) -> HookFuture + Send + Sync>;
type ActionHook = Arc<dyn Fn(Action) -> HookFuture + Send + Sync>;

/// Callbacks invoked inside a bound [`Context`](crate::Context).
///
/// Every hook is optional. A deployment without a chat-start or message hook
/// refuses duplex connections.
#[derive(Clone, Default)]
pub struct Hooks {
    pub(crate) chat_start: Option<Hook>,
    pub(crate) message: Option<MessageHook>,
    pub(crate) stop: Option<Hook>,
    pub(crate) chat_end: Option<Hook>,
    pub(crate) settings_update: Option<SettingsHook>,
    pub(crate) file_upload: Option<(FileSpec, ValueHook)>,
    pub(crate) actions: HashMap<String, ActionHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut actions: Vec<_> = self.actions.keys().collect();
        actions.sort();
        f.debug_struct("Hooks")
            .field("chat_start", &self.chat_start.is_some())
            .field("message", &self.message.is_some())
            .field("stop", &self.stop.is_some())
            .field("chat_end", &self.chat_end.is_some())
            .field("settings_update", &self.settings_update.is_some())
            .field("file_upload", &self.file_upload.as_ref().map(|(spec, _)| spec))
            .field("actions", &actions)
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a duplex chat endpoint should accept connections.
    pub fn serves_chat(&self) -> bool {
        self.chat_start.is_some() || self.message.is_some()
    }

    pub fn on_chat_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.chat_start = Some(Arc::new(move || -> HookFuture { Box::pin(hook()) }));
        self
    }

    /// Called with the trimmed message content and the message id.
    pub fn on_message<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.message = Some(Arc::new(move |content: String, id: String| -> HookFuture {
            Box::pin(hook(content, id))
        }));
        self
    }

    pub fn on_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stop = Some(Arc::new(move || -> HookFuture { Box::pin(hook()) }));
        self
    }

    pub fn on_chat_end<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.chat_end = Some(Arc::new(move || -> HookFuture { Box::pin(hook()) }));
        self
    }

    /// Called with the full incoming settings payload after it was merged.
    pub fn on_settings_update<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.settings_update = Some(Arc::new(move |settings: Map<String, Value>| -> HookFuture {
            Box::pin(hook(settings))
        }));
        self
    }

    /// Enable uploads; `spec` is announced to every fresh session.
    pub fn on_file_upload<F, Fut>(mut self, spec: FileSpec, hook: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: ValueHook =
            Arc::new(move |files: Value| -> HookFuture { Box::pin(hook(files)) });
        self.file_upload = Some((spec, callback));
        self
    }

    /// Register the callback for action `name`, replacing any previous one.
    pub fn action<F, Fut>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(Action) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: ActionHook =
            Arc::new(move |action: Action| -> HookFuture { Box::pin(hook(action)) });
        self.actions.insert(name.into(), callback);
        self
    }

    pub(crate) fn action_hook(&self, name: &str) -> Option<ActionHook> {
        self.actions.get(name).cloned()
    }

    pub fn upload_spec(&self) -> Option<&FileSpec> {
        self.file_upload.as_ref().map(|(spec, _)| spec)
    }
}
