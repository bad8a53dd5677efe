//! The external session/puzzle metadata service the router assumes exists
//! (spec: "session exists and `status = active`"). Out of scope to
//! implement for real — persistent puzzle metadata lives outside this
//! core — so it is expressed as a narrow trait the router calls through,
//! with an in-memory stub in `testutil` standing in for it in tests.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub puzzle_id: String,
    pub status: SessionStatus,
}

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Looks up a session by id. `None` means the session does not exist
    /// as far as this collaborator knows (maps to `SessionNotFound`).
    async fn lookup(&self, session_id: &str) -> Option<SessionSnapshot>;
}
