use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A 2D position plus rotation, in whatever units the board uses.
/// Rotation is stored unnormalized; comparisons normalize modulo 360.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
}

/// A single jigsaw piece's current state within one puzzle session.
///
/// `lock_owner`/`lock_expiry` are the durable store's cache of the live K/V
/// lock record: `LockCoordinator` keeps them in sync on every acquire,
/// release and extend so a reader of the durable store alone (no K/V
/// access) can still see who holds a piece and until when.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Piece {
    pub id: String,
    pub position: Position,
    pub target: Position,
    pub is_placed: bool,
    pub lock_owner: Option<String>,
    pub lock_expiry: Option<DateTime<Utc>>,
}

/// The result of a `PieceStore::update_position` call, mirroring the
/// response shape callers get back over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub applied: bool,
    pub new_position: Position,
    pub is_placed: bool,
    pub completed_count: u32,
    pub total_count: u32,
    pub puzzle_complete: bool,
}
