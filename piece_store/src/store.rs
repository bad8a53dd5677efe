use async_trait::async_trait;
use chrono::{DateTime, Utc};
use wire::RouterError;

use crate::types::{Piece, Position, UpdateOutcome};

/// The contract the session router holds the piece-state store to.
/// Positional tolerance is 5 units, rotational tolerance 5 degrees modulo
/// 360: a piece is "placed" when it is within both of its target.
#[async_trait]
pub trait PieceStore: Send + Sync {
    async fn update_position(
        &self,
        session_id: &str,
        piece_id: &str,
        position: Position,
    ) -> Result<UpdateOutcome, RouterError>;

    async fn get_piece(&self, session_id: &str, piece_id: &str) -> Result<Option<Piece>, RouterError>;

    async fn snapshot(&self, session_id: &str) -> Result<Vec<Piece>, RouterError>;

    /// Mirrors a live K/V lock into the durable piece record: `owner =
    /// None` clears it. `LockCoordinator` calls this on every acquire and
    /// release so `Piece.lock_owner` never disagrees with the K/V lock for
    /// longer than the round trip between the two writes.
    async fn set_lock(
        &self,
        session_id: &str,
        piece_id: &str,
        owner: Option<String>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), RouterError>;

    /// Clears `lock_owner`/`lock_expiry` on every piece, in every session,
    /// whose `lock_owner` currently equals `owner_id`, returning how many
    /// were cleared. Called when a connection's locks are swept away in
    /// bulk so the durable cache does not retain a lock the K/V store no
    /// longer has.
    async fn clear_locks_for(&self, owner_id: &str) -> Result<u32, RouterError>;
}
