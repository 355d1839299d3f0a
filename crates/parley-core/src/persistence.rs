// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Conversation persistence backend seam

use crate::message::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Stores conversations and the messages exchanged in them.
///
/// Message persistence is best-effort: failures are logged by the caller and
/// never stop the message from reaching the client.
#[async_trait]
pub trait ConversationClient: Send + Sync {
    /// Create a conversation and return its id.
    async fn create_conversation(
        &self,
        user_id: Option<&str>,
        tags: &[String],
    ) -> anyhow::Result<String>;

    /// Store a message; may return a backend-assigned message id.
    async fn create_message(&self, message: &Message) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub id: String,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
    pub messages: Vec<Message>,
}

/// Process-local backend used by the demo binary and tests
#[derive(Debug, Default)]
pub struct InMemoryConversationClient {
    conversations: Mutex<HashMap<String, StoredConversation>>,
    orphans: Mutex<Vec<Message>>,
}

impl InMemoryConversationClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation(&self, id: &str) -> Option<StoredConversation> {
        self.conversations.lock().get(id).cloned()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.lock().len()
    }

    /// Messages stored without a conversation id.
    pub fn orphan_messages(&self) -> Vec<Message> {
        self.orphans.lock().clone()
    }
}

#[async_trait]
impl ConversationClient for InMemoryConversationClient {
    async fn create_conversation(
        &self,
        user_id: Option<&str>,
        tags: &[String],
    ) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conversation = StoredConversation {
            id: id.clone(),
            user_id: user_id.map(str::to_string),
            tags: tags.to_vec(),
            messages: Vec::new(),
        };
        self.conversations.lock().insert(id.clone(), conversation);
        Ok(id)
    }

    async fn create_message(&self, message: &Message) -> anyhow::Result<Option<String>> {
        match &message.conversation_id {
            Some(conversation_id) => {
                let mut conversations = self.conversations.lock();
                let conversation = conversations
                    .get_mut(conversation_id)
                    .ok_or_else(|| anyhow::anyhow!("Unknown conversation {conversation_id}"))?;
                conversation.messages.push(message.clone());
            }
            None => self.orphans.lock().push(message.clone()),
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_land_in_their_conversation() {
        let client = InMemoryConversationClient::new();
        let id = client
            .create_conversation(Some("u-1"), &["chat".to_string()])
            .await
            .unwrap();

        let mut message = Message::new("hi");
        message.conversation_id = Some(id.clone());
        client.create_message(&message).await.unwrap();

        let stored = client.conversation(&id).unwrap();
        assert_eq!(stored.user_id.as_deref(), Some("u-1"));
        assert_eq!(stored.tags, vec!["chat".to_string()]);
        assert_eq!(stored.messages.len(), 1);
    }

    #[tokio::test]
    async fn unknown_conversation_is_an_error() {
        let client = InMemoryConversationClient::new();
        let mut message = Message::new("hi");
        message.conversation_id = Some("missing".into());
        assert!(client.create_message(&message).await.is_err());
    }
}
