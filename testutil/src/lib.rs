//! In-memory stand-ins for the two narrow collaborator traits
//! `session_router` calls through but does not own an implementation of:
//! chat persistence and session metadata lookup. A real deployment backs
//! these with its durable store; these stubs are what the rest of the
//! workspace's tests (and `hub_server`, when no such store is configured)
//! use in their place.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use session_router::{ChatMessage, ChatRepository, SessionDirectory, SessionSnapshot, SessionStatus};

/// Keeps every persisted chat message in memory, in arrival order. Message
/// ids are generated here, not by the router: persistence is the one place
/// that is allowed to fail, so it is also the natural place to mint the id
/// the caller gets back on success.
#[derive(Default)]
pub struct InMemoryChatRepository {
    messages: Mutex<Vec<ChatMessage>>,
}

impl InMemoryChatRepository {
    pub fn new() -> Self {
        InMemoryChatRepository::default()
    }

    pub fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChatRepository for InMemoryChatRepository {
    async fn persist(&self, session_id: &str, user_id: &str, text: &str) -> Result<ChatMessage, String> {
        let message = ChatMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        self.messages.lock().push(message.clone());
        Ok(message)
    }
}

/// A fixed table of known sessions, seeded by a test (or `hub_server`'s
/// startup, in the absence of a real session metadata service) before any
/// connection tries to join one.
#[derive(Default)]
pub struct InMemorySessionDirectory {
    sessions: Mutex<HashMap<String, SessionSnapshot>>,
}

impl InMemorySessionDirectory {
    pub fn new() -> Self {
        InMemorySessionDirectory::default()
    }

    pub fn seed(&self, session_id: impl Into<String>, puzzle_id: impl Into<String>, status: SessionStatus) {
        let session_id = session_id.into();
        self.sessions.lock().insert(
            session_id.clone(),
            SessionSnapshot {
                session_id,
                puzzle_id: puzzle_id.into(),
                status,
            },
        );
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) {
        if let Some(snapshot) = self.sessions.lock().get_mut(session_id) {
            snapshot.status = status;
        }
    }
}

#[async_trait]
impl SessionDirectory for InMemorySessionDirectory {
    async fn lookup(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions.lock().get(session_id).cloned()
    }
}
