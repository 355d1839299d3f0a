// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inbound events handled after a connection was accepted

use crate::message::{Action, Message};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ConnectionSuccessful,
    UiMessage(Message),
    Stop,
    ClearSession,
    Disconnect,
    ActionCall(Action),
    ChatSettingsChange(Map<String, Value>),
    FileUpload(Value),
}

impl InboundEvent {
    /// Build an event from its transport name and payload.
    pub fn from_parts(event: &str, data: Value) -> anyhow::Result<Self> {
        Ok(match event {
            "connection_successful" => Self::ConnectionSuccessful,
            "ui_message" => Self::UiMessage(serde_json::from_value(data)?),
            "stop" => Self::Stop,
            "clear_session" => Self::ClearSession,
            "disconnect" => Self::Disconnect,
            "action_call" => Self::ActionCall(serde_json::from_value(data)?),
            "chat_settings_change" => match data {
                Value::Object(settings) => Self::ChatSettingsChange(settings),
                Value::Null => Self::ChatSettingsChange(Map::new()),
                other => anyhow::bail!("Settings must be an object, got {other}"),
            },
            "file_upload" => Self::FileUpload(data),
            other => anyhow::bail!("Unknown event {other}"),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionSuccessful => "connection_successful",
            Self::UiMessage(_) => "ui_message",
            Self::Stop => "stop",
            Self::ClearSession => "clear_session",
            Self::Disconnect => "disconnect",
            Self::ActionCall(_) => "action_call",
            Self::ChatSettingsChange(_) => "chat_settings_change",
            Self::FileUpload(_) => "file_upload",
        }
    }
}
