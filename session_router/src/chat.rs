//! The external chat history store the router persists through (spec:
//! "persist via external chat repository"). Out of scope to implement for
//! real; expressed as a trait so `testutil` can supply an in-memory stand-in
//! and a real deployment can supply its durable store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChatMessage {
    pub message_id: String,
    pub session_id: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn persist(&self, session_id: &str, user_id: &str, text: &str) -> Result<ChatMessage, String>;
}
