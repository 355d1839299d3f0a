// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! JSON text framing used on the socket
//!
//! Every frame is `{"event": <name>, "data": <payload>}`. Asks additionally
//! carry an `id`, echoed back by the client in an `ask_response` frame.

use parley_core::InboundEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ASK_RESPONSE_EVENT: &str = "ask_response";
pub const RELOAD_EVENT: &str = "reload";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Frame {
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            id: None,
        }
    }

    pub fn request(event: impl Into<String>, id: u64, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            id: Some(id),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[derive(Debug, Deserialize)]
struct AskAnswer {
    id: u64,
    #[serde(default)]
    response: Value,
}

/// A decoded client frame
#[derive(Debug, PartialEq)]
pub enum ClientFrame {
    Event(InboundEvent),
    AskResponse { id: u64, response: Value },
}

impl ClientFrame {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let frame: Frame = serde_json::from_str(text)?;
        if frame.event == ASK_RESPONSE_EVENT {
            let answer: AskAnswer = serde_json::from_value(frame.data)?;
            return Ok(ClientFrame::AskResponse {
                id: answer.id,
                response: answer.response,
            });
        }
        Ok(ClientFrame::Event(InboundEvent::from_parts(&frame.event, frame.data)?))
    }
}
