//! Pure data: the payload shape of every event the router can emit.
//!
//! These structs carry no behavior and touch no adapter; `router.rs` is the
//! only place that decides *when* to build one and *where* it goes. Keeping
//! the two separate is the "domain event builder" split called for in the
//! REDESIGN FLAGS: the mixed hub in the source built events, looked up
//! display names, and talked to adapters all in one place.

use chrono::{DateTime, Utc};
use serde::Serialize;
use wire::EventKind;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserJoined {
    pub user_id: String,
    pub display_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserLeft {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PieceMoved {
    pub piece_id: String,
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
    pub mover: String,
    pub placed: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PieceLocked {
    pub piece_id: String,
    pub owner: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PieceUnlocked {
    pub piece_id: String,
    pub by: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChatMessageEvent {
    pub message_id: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CursorUpdateEvent {
    pub user_id: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParticipantPlacedCount {
    pub user_id: String,
    pub placed_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PuzzleCompleted {
    pub total_time_seconds: i64,
    pub participants: Vec<ParticipantPlacedCount>,
}

/// Every event this module knows how to build, paired with the `EventKind`
/// it serializes under on the wire. One place to keep the two in sync.
pub enum Event {
    UserJoined(UserJoined),
    UserLeft(UserLeft),
    PieceMoved(PieceMoved),
    PieceLocked(PieceLocked),
    PieceUnlocked(PieceUnlocked),
    ChatMessage(ChatMessageEvent),
    CursorUpdate(CursorUpdateEvent),
    PuzzleCompleted(PuzzleCompleted),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::UserJoined(_) => EventKind::UserJoined,
            Event::UserLeft(_) => EventKind::UserLeft,
            Event::PieceMoved(_) => EventKind::PieceMoved,
            Event::PieceLocked(_) => EventKind::PieceLocked,
            Event::PieceUnlocked(_) => EventKind::PieceUnlocked,
            Event::ChatMessage(_) => EventKind::ChatMessage,
            Event::CursorUpdate(_) => EventKind::CursorUpdate,
            Event::PuzzleCompleted(_) => EventKind::PuzzleCompleted,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            Event::UserJoined(e) => serde_json::to_value(e),
            Event::UserLeft(e) => serde_json::to_value(e),
            Event::PieceMoved(e) => serde_json::to_value(e),
            Event::PieceLocked(e) => serde_json::to_value(e),
            Event::PieceUnlocked(e) => serde_json::to_value(e),
            Event::ChatMessage(e) => serde_json::to_value(e),
            Event::CursorUpdate(e) => serde_json::to_value(e),
            Event::PuzzleCompleted(e) => serde_json::to_value(e),
        }
        .expect("domain event payloads are always representable as JSON")
    }
}
