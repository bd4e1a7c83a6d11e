use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::reducer::ChatMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Local persistence for transcripts and the last known session list,
/// keyed by server so switching agents never mixes histories.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn fetch_messages(&self, server_key: &str, session_id: &str) -> Result<Vec<ChatMessage>>;

    async fn save_messages(
        &self,
        server_key: &str,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> Result<()>;

    async fn fetch_sessions(&self, server_key: &str) -> Result<Vec<SessionSummary>>;

    async fn save_sessions(&self, server_key: &str, sessions: &[SessionSummary]) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryStore {
    messages: RwLock<HashMap<(String, String), Vec<ChatMessage>>>,
    sessions: RwLock<HashMap<String, Vec<SessionSummary>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn fetch_messages(&self, server_key: &str, session_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(self
            .messages
            .read()
            .get(&(server_key.to_string(), session_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_messages(
        &self,
        server_key: &str,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> Result<()> {
        self.messages.write().insert(
            (server_key.to_string(), session_id.to_string()),
            messages.to_vec(),
        );
        Ok(())
    }

    async fn fetch_sessions(&self, server_key: &str) -> Result<Vec<SessionSummary>> {
        Ok(self
            .sessions
            .read()
            .get(server_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_sessions(&self, server_key: &str, sessions: &[SessionSummary]) -> Result<()> {
        self.sessions
            .write()
            .insert(server_key.to_string(), sessions.to_vec());
        Ok(())
    }
}
