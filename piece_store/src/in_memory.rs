use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use wire::RouterError;

use crate::store::PieceStore;
use crate::types::{Piece, Position, UpdateOutcome};

struct PuzzleState {
    pieces: HashMap<String, Piece>,
    /// Set once this session's completed count has reached its total, so
    /// `puzzle_complete` reports `true` only on the move that causes the
    /// transition, never on moves made afterward.
    complete_announced: bool,
}

/// A reference implementation of `PieceStore` that keeps every puzzle's
/// pieces in memory, seeded with a target position up front. A real
/// deployment backs this with whatever durable store owns puzzle
/// metadata; this is what the rest of the system (and its tests) call in
/// its place.
pub struct InMemoryPieceStore {
    puzzles: Mutex<HashMap<String, PuzzleState>>,
    position_tolerance: f64,
    rotation_tolerance_degrees: f64,
}

/// Smallest angle between two rotations, normalized into `[0, 180]`
/// degrees regardless of how `a` and `b` are represented modulo 360.
fn angular_distance(a: f64, b: f64) -> f64 {
    let raw = (a - b).rem_euclid(360.0);
    raw.min(360.0 - raw)
}

impl InMemoryPieceStore {
    pub fn new(position_tolerance: f64, rotation_tolerance_degrees: f64) -> Self {
        InMemoryPieceStore {
            puzzles: Mutex::new(HashMap::new()),
            position_tolerance,
            rotation_tolerance_degrees,
        }
    }

    fn is_placed(&self, position: &Position, target: &Position) -> bool {
        let dx = position.x - target.x;
        let dy = position.y - target.y;
        let distance = dx.hypot(dy);
        distance <= self.position_tolerance
            && angular_distance(position.rotation, target.rotation) <= self.rotation_tolerance_degrees
    }

    /// Seeds a puzzle session with its pieces, each starting at `initial`
    /// and placed when moved within tolerance of `target`.
    pub fn seed_puzzle(&self, session_id: &str, pieces: Vec<(String, Position, Position)>) {
        let mut state = PuzzleState {
            pieces: HashMap::new(),
            complete_announced: false,
        };
        for (id, target, initial) in pieces {
            let is_placed = self.is_placed(&initial, &target);
            state.pieces.insert(
                id.clone(),
                Piece {
                    id,
                    position: initial,
                    target,
                    is_placed,
                    lock_owner: None,
                    lock_expiry: None,
                },
            );
        }
        self.puzzles.lock().insert(session_id.to_string(), state);
    }
}

#[async_trait]
impl PieceStore for InMemoryPieceStore {
    async fn update_position(
        &self,
        session_id: &str,
        piece_id: &str,
        position: Position,
    ) -> Result<UpdateOutcome, RouterError> {
        let mut puzzles = self.puzzles.lock();
        let state = puzzles
            .get_mut(session_id)
            .ok_or(RouterError::PieceNotFound)?;
        let piece = state.pieces.get(piece_id).ok_or(RouterError::PieceNotFound)?;
        let target = piece.target;
        // Placement is sticky: once a piece has been placed, a later move
        // away from its target does not un-place it, keeping the
        // per-session completed count monotone.
        let is_placed = piece.is_placed || self.is_placed(&position, &target);
        if let Some(piece) = state.pieces.get_mut(piece_id) {
            piece.position = position;
            piece.is_placed = is_placed;
        }
        let total_count = state.pieces.len() as u32;
        let completed_count = state.pieces.values().filter(|p| p.is_placed).count() as u32;
        // `puzzle_complete` fires only on the move that crosses the
        // threshold: the completed count is monotone once placement is
        // sticky, so a bare equality check would re-report completion on
        // every move made afterward.
        let is_now_complete = total_count > 0 && completed_count == total_count;
        let puzzle_complete = is_now_complete && !state.complete_announced;
        if is_now_complete {
            state.complete_announced = true;
        }
        Ok(UpdateOutcome {
            applied: true,
            new_position: position,
            is_placed,
            completed_count,
            total_count,
            puzzle_complete,
        })
    }

    async fn get_piece(&self, session_id: &str, piece_id: &str) -> Result<Option<Piece>, RouterError> {
        let puzzles = self.puzzles.lock();
        Ok(puzzles
            .get(session_id)
            .and_then(|state| state.pieces.get(piece_id))
            .cloned())
    }

    async fn snapshot(&self, session_id: &str) -> Result<Vec<Piece>, RouterError> {
        let puzzles = self.puzzles.lock();
        Ok(puzzles
            .get(session_id)
            .map(|state| state.pieces.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_lock(
        &self,
        session_id: &str,
        piece_id: &str,
        owner: Option<String>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), RouterError> {
        let mut puzzles = self.puzzles.lock();
        let state = puzzles
            .get_mut(session_id)
            .ok_or(RouterError::PieceNotFound)?;
        let piece = state
            .pieces
            .get_mut(piece_id)
            .ok_or(RouterError::PieceNotFound)?;
        piece.lock_owner = owner;
        piece.lock_expiry = expiry;
        Ok(())
    }

    async fn clear_locks_for(&self, owner_id: &str) -> Result<u32, RouterError> {
        let mut cleared = 0;
        for state in self.puzzles.lock().values_mut() {
            for piece in state.pieces.values_mut() {
                if piece.lock_owner.as_deref() == Some(owner_id) {
                    piece.lock_owner = None;
                    piece.lock_expiry = None;
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: f64, y: f64, rotation: f64) -> Position {
        Position { x, y, rotation }
    }

    #[tokio::test]
    async fn move_within_tolerance_marks_placed() {
        let store = InMemoryPieceStore::new(5.0, 5.0);
        store.seed_puzzle(
            "s1",
            vec![("p1".to_string(), pos(100.0, 100.0, 0.0), pos(0.0, 0.0, 0.0))],
        );
        let outcome = store
            .update_position("s1", "p1", pos(102.0, 101.0, 358.0))
            .await
            .unwrap();
        assert!(outcome.is_placed);
        assert!(outcome.puzzle_complete);
        assert_eq!(outcome.completed_count, 1);
        assert_eq!(outcome.total_count, 1);
    }

    #[tokio::test]
    async fn move_outside_tolerance_is_not_placed() {
        let store = InMemoryPieceStore::new(5.0, 5.0);
        store.seed_puzzle(
            "s1",
            vec![("p1".to_string(), pos(100.0, 100.0, 0.0), pos(0.0, 0.0, 0.0))],
        );
        let outcome = store
            .update_position("s1", "p1", pos(120.0, 100.0, 0.0))
            .await
            .unwrap();
        assert!(!outcome.is_placed);
        assert!(!outcome.puzzle_complete);
    }

    #[tokio::test]
    async fn rotation_tolerance_wraps_across_zero() {
        let store = InMemoryPieceStore::new(5.0, 5.0);
        store.seed_puzzle(
            "s1",
            vec![("p1".to_string(), pos(0.0, 0.0, 359.0), pos(0.0, 0.0, 359.0))],
        );
        let outcome = store.update_position("s1", "p1", pos(0.0, 0.0, 2.0)).await.unwrap();
        assert!(outcome.is_placed);
    }

    #[tokio::test]
    async fn placement_is_sticky_across_later_moves() {
        let store = InMemoryPieceStore::new(5.0, 5.0);
        store.seed_puzzle(
            "s1",
            vec![("p1".to_string(), pos(0.0, 0.0, 0.0), pos(500.0, 500.0, 0.0))],
        );
        let placed = store.update_position("s1", "p1", pos(1.0, 1.0, 0.0)).await.unwrap();
        assert!(placed.is_placed);

        let moved_away = store.update_position("s1", "p1", pos(300.0, 300.0, 0.0)).await.unwrap();
        assert!(moved_away.is_placed, "placement must not regress once achieved");
        assert_eq!(moved_away.completed_count, 1);
    }

    #[tokio::test]
    async fn puzzle_complete_does_not_refire_on_a_later_move() {
        let store = InMemoryPieceStore::new(5.0, 5.0);
        store.seed_puzzle(
            "s1",
            vec![("p1".to_string(), pos(100.0, 100.0, 0.0), pos(0.0, 0.0, 0.0))],
        );
        let completing = store.update_position("s1", "p1", pos(100.0, 100.0, 0.0)).await.unwrap();
        assert!(completing.puzzle_complete);

        let later = store.update_position("s1", "p1", pos(101.0, 100.0, 0.0)).await.unwrap();
        assert!(!later.puzzle_complete, "completion must be reported once, on the transition only");
        assert_eq!(later.completed_count, later.total_count);
    }

    #[tokio::test]
    async fn set_lock_and_clear_locks_for_round_trip() {
        let store = InMemoryPieceStore::new(5.0, 5.0);
        store.seed_puzzle(
            "s1",
            vec![("p1".to_string(), pos(0.0, 0.0, 0.0), pos(0.0, 0.0, 0.0))],
        );
        store.set_lock("s1", "p1", Some("conn-a".to_string()), None).await.unwrap();
        let piece = store.get_piece("s1", "p1").await.unwrap().unwrap();
        assert_eq!(piece.lock_owner.as_deref(), Some("conn-a"));

        let cleared = store.clear_locks_for("conn-a").await.unwrap();
        assert_eq!(cleared, 1);
        let piece = store.get_piece("s1", "p1").await.unwrap().unwrap();
        assert_eq!(piece.lock_owner, None);
    }

    #[tokio::test]
    async fn unknown_piece_is_an_error() {
        let store = InMemoryPieceStore::new(5.0, 5.0);
        store.seed_puzzle("s1", vec![]);
        let result = store.update_position("s1", "missing", pos(0.0, 0.0, 0.0)).await;
        assert!(matches!(result, Err(RouterError::PieceNotFound)));
    }
}
