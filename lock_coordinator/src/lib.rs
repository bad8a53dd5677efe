//! The piece-lock coordinator: TTL-bounded exclusive locks over
//! `(session, piece)` pairs, backed by the K/V store, with a short
//! reconciliation window for a crashed owner's lock to be silently
//! reclaimed by the same connection instead of handed to someone else.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use kv_store::{KvStore, SetMode};
use parking_lot::Mutex;
use piece_store::PieceStore;
use wire::RouterError;

/// How much longer the shadow ownership record outlives the primary lock
/// key. A reconciliation claim only succeeds inside this window after the
/// primary key's TTL has lapsed; once the shadow itself expires, the lock
/// is gone for good and any caller can acquire it fresh.
const RECONCILIATION_WINDOW: Duration = Duration::from_secs(10);

pub struct LockCoordinator {
    store: Arc<dyn KvStore>,
    pieces: Arc<dyn PieceStore>,
    ttl: Duration,
    held_by_connection: Mutex<HashMap<String, HashSet<(String, String)>>>,
}

fn lock_key(session_id: &str, piece_id: &str) -> String {
    format!("lock:{session_id}:{piece_id}")
}

fn shadow_key(session_id: &str, piece_id: &str) -> String {
    format!("lock:{session_id}:{piece_id}:owner")
}

/// `Utc::now() + ttl`, used as the durable `Piece.lock_expiry` mirror of a
/// K/V key written with the same TTL.
fn expiry_at(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn KvStore>, pieces: Arc<dyn PieceStore>, ttl: Duration) -> Self {
        LockCoordinator {
            store,
            pieces,
            ttl,
            held_by_connection: Mutex::new(HashMap::new()),
        }
    }

    /// Mirrors a freshly written (or renewed) K/V lock into the durable
    /// `Piece.lock_owner`/`lock_expiry` fields, keeping the invariant that
    /// the durable cache never disagrees with the live lock record.
    async fn sync_durable_owner(&self, session_id: &str, piece_id: &str, connection_id: &str) -> Result<(), RouterError> {
        self.pieces
            .set_lock(session_id, piece_id, Some(connection_id.to_string()), Some(expiry_at(self.ttl)))
            .await
    }

    async fn clear_durable_owner(&self, session_id: &str, piece_id: &str) -> Result<(), RouterError> {
        self.pieces.set_lock(session_id, piece_id, None, None).await
    }

    fn track(&self, connection_id: &str, session_id: &str, piece_id: &str) {
        self.held_by_connection
            .lock()
            .entry(connection_id.to_string())
            .or_default()
            .insert((session_id.to_string(), piece_id.to_string()));
    }

    fn untrack(&self, connection_id: &str, session_id: &str, piece_id: &str) {
        if let Some(held) = self.held_by_connection.lock().get_mut(connection_id) {
            held.remove(&(session_id.to_string(), piece_id.to_string()));
        }
    }

    async fn set_shadow(&self, session_id: &str, piece_id: &str, connection_id: &str) -> Result<(), RouterError> {
        self.store
            .set(
                &shadow_key(session_id, piece_id),
                Bytes::from(connection_id.to_string()),
                Some(self.ttl + RECONCILIATION_WINDOW),
                SetMode::Always,
            )
            .await?;
        Ok(())
    }

    /// Acquires the lock for `connection_id`, or fails with
    /// `PieceLocked { current_owner }` if someone else holds it.
    ///
    /// If the primary lock key has expired but a shadow record shows the
    /// same connection held it within the reconciliation window, the
    /// claim is accepted and the shadow is cleared: one grace
    /// reacquisition, not an indefinite one.
    pub async fn acquire(&self, session_id: &str, piece_id: &str, connection_id: &str) -> Result<(), RouterError> {
        let key = lock_key(session_id, piece_id);
        let owner_value = Bytes::from(connection_id.to_string());

        if self
            .store
            .set(&key, owner_value.clone(), Some(self.ttl), SetMode::IfAbsent)
            .await?
        {
            self.set_shadow(session_id, piece_id, connection_id).await?;
            self.sync_durable_owner(session_id, piece_id, connection_id).await?;
            self.track(connection_id, session_id, piece_id);
            return Ok(());
        }

        match self.store.get(&key).await? {
            Some(current) if current == owner_value => {
                self.track(connection_id, session_id, piece_id);
                Ok(())
            }
            Some(current) => Err(RouterError::PieceLocked {
                current_owner: Some(String::from_utf8_lossy(&current).into_owned()),
            }),
            None => self.reconcile_or_reject(session_id, piece_id, connection_id).await,
        }
    }

    async fn reconcile_or_reject(
        &self,
        session_id: &str,
        piece_id: &str,
        connection_id: &str,
    ) -> Result<(), RouterError> {
        let key = lock_key(session_id, piece_id);
        let owner_value = Bytes::from(connection_id.to_string());
        let shadow = self.store.get(&shadow_key(session_id, piece_id)).await?;
        if shadow.as_deref() == Some(connection_id.as_bytes()) {
            self.store
                .set(&key, owner_value, Some(self.ttl), SetMode::Always)
                .await?;
            self.store.delete(&shadow_key(session_id, piece_id)).await?;
            self.sync_durable_owner(session_id, piece_id, connection_id).await?;
            self.track(connection_id, session_id, piece_id);
            return Ok(());
        }
        // Someone else may have taken it between our failed IfAbsent set and
        // this read; a last attempt at a clean acquire covers that race.
        if self
            .store
            .set(&key, owner_value, Some(self.ttl), SetMode::IfAbsent)
            .await?
        {
            self.set_shadow(session_id, piece_id, connection_id).await?;
            self.sync_durable_owner(session_id, piece_id, connection_id).await?;
            self.track(connection_id, session_id, piece_id);
            return Ok(());
        }
        let current = self.store.get(&key).await?;
        Err(RouterError::PieceLocked {
            current_owner: current.map(|c| String::from_utf8_lossy(&c).into_owned()),
        })
    }

    /// Reads the current lock owner without attempting to acquire it.
    /// `None` means the piece is unlocked (or its lock has expired).
    pub async fn current_owner(&self, session_id: &str, piece_id: &str) -> Result<Option<String>, RouterError> {
        let key = lock_key(session_id, piece_id);
        Ok(self
            .store
            .get(&key)
            .await?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub async fn release(&self, session_id: &str, piece_id: &str, connection_id: &str) -> Result<(), RouterError> {
        let key = lock_key(session_id, piece_id);
        match self.store.get(&key).await? {
            Some(current) if current == connection_id.as_bytes() => {
                self.store.delete(&key).await?;
                self.store.delete(&shadow_key(session_id, piece_id)).await?;
                self.clear_durable_owner(session_id, piece_id).await?;
                self.untrack(connection_id, session_id, piece_id);
                Ok(())
            }
            Some(_) => Err(RouterError::NotOwner),
            None => Err(RouterError::NotOwner),
        }
    }

    /// Refreshes the lock's TTL. Honors the same reconciliation window as
    /// `acquire`: an extend from the last known owner inside the window
    /// succeeds even if the primary key already expired.
    pub async fn extend(&self, session_id: &str, piece_id: &str, connection_id: &str) -> Result<(), RouterError> {
        let key = lock_key(session_id, piece_id);
        match self.store.get(&key).await? {
            Some(current) if current == connection_id.as_bytes() => {
                self.store
                    .set(&key, current, Some(self.ttl), SetMode::Always)
                    .await?;
                self.set_shadow(session_id, piece_id, connection_id).await?;
                self.sync_durable_owner(session_id, piece_id, connection_id).await?;
                Ok(())
            }
            Some(_) => Err(RouterError::NotOwner),
            None => self.reconcile_or_reject(session_id, piece_id, connection_id).await,
        }
    }

    /// Releases every lock `connection_id` currently holds, called when a
    /// connection detaches or is swept for inactivity. Returns the
    /// `(session_id, piece_id)` pairs actually released, so the caller can
    /// announce each as a system-initiated unlock.
    pub async fn release_all_for(&self, connection_id: &str) -> Result<Vec<(String, String)>, RouterError> {
        let held = self
            .held_by_connection
            .lock()
            .remove(connection_id)
            .unwrap_or_default();
        let mut released = Vec::new();
        for (session_id, piece_id) in held {
            // Best-effort: a lock that already expired or moved on is not
            // an error here, the caller is cleaning up, not contesting.
            if self.release(&session_id, &piece_id, connection_id).await.is_ok() {
                released.push((session_id, piece_id));
            }
        }
        // `release` above only clears the durable owner for locks it still
        // found live in the K/V store; a lock this connection held but
        // that already expired there leaves its durable record stale.
        // Sweep the rest directly so the cache never outlives the K/V lock.
        self.pieces.clear_locks_for(connection_id).await?;
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_store::InMemoryKvStore;
    use piece_store::{InMemoryPieceStore, Position};

    fn coordinator() -> LockCoordinator {
        let pieces = Arc::new(InMemoryPieceStore::new(5.0, 5.0));
        let origin = Position { x: 0.0, y: 0.0, rotation: 0.0 };
        pieces.seed_puzzle(
            "s1",
            vec![
                ("p1".to_string(), origin, origin),
                ("p2".to_string(), origin, origin),
            ],
        );
        LockCoordinator::new(Arc::new(InMemoryKvStore::new()), pieces, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn acquire_then_release_round_trips() {
        let lc = coordinator();
        lc.acquire("s1", "p1", "conn-a").await.unwrap();
        lc.release("s1", "p1", "conn-a").await.unwrap();
        lc.acquire("s1", "p1", "conn-b").await.unwrap();
    }

    #[tokio::test]
    async fn second_caller_is_rejected_with_owner() {
        let lc = coordinator();
        lc.acquire("s1", "p1", "conn-a").await.unwrap();
        let err = lc.acquire("s1", "p1", "conn-b").await.unwrap_err();
        match err {
            RouterError::PieceLocked { current_owner } => assert_eq!(current_owner.as_deref(), Some("conn-a")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_by_non_owner_is_rejected() {
        let lc = coordinator();
        lc.acquire("s1", "p1", "conn-a").await.unwrap();
        let err = lc.release("s1", "p1", "conn-b").await.unwrap_err();
        assert!(matches!(err, RouterError::NotOwner));
    }

    #[tokio::test]
    async fn release_all_for_clears_every_lock_of_a_connection() {
        let lc = coordinator();
        lc.acquire("s1", "p1", "conn-a").await.unwrap();
        lc.acquire("s1", "p2", "conn-a").await.unwrap();
        let mut released = lc.release_all_for("conn-a").await.unwrap();
        released.sort();
        assert_eq!(
            released,
            vec![("s1".to_string(), "p1".to_string()), ("s1".to_string(), "p2".to_string())]
        );
        lc.acquire("s1", "p1", "conn-b").await.unwrap();
        lc.acquire("s1", "p2", "conn-b").await.unwrap();
    }

    #[tokio::test]
    async fn reacquiring_own_lock_is_idempotent() {
        let lc = coordinator();
        lc.acquire("s1", "p1", "conn-a").await.unwrap();
        lc.acquire("s1", "p1", "conn-a").await.unwrap();
    }

    #[tokio::test]
    async fn acquire_and_release_sync_durable_lock_owner() {
        let pieces = Arc::new(InMemoryPieceStore::new(5.0, 5.0));
        let origin = Position { x: 0.0, y: 0.0, rotation: 0.0 };
        pieces.seed_puzzle("s1", vec![("p1".to_string(), origin, origin)]);
        let lc = LockCoordinator::new(Arc::new(InMemoryKvStore::new()), pieces.clone(), Duration::from_secs(30));

        lc.acquire("s1", "p1", "conn-a").await.unwrap();
        let piece = pieces.get_piece("s1", "p1").await.unwrap().unwrap();
        assert_eq!(piece.lock_owner.as_deref(), Some("conn-a"));
        assert!(piece.lock_expiry.is_some());

        lc.release("s1", "p1", "conn-a").await.unwrap();
        let piece = pieces.get_piece("s1", "p1").await.unwrap().unwrap();
        assert_eq!(piece.lock_owner, None);
        assert_eq!(piece.lock_expiry, None);
    }

    #[tokio::test]
    async fn release_all_for_clears_durable_owner_even_if_kv_lock_already_gone() {
        let pieces = Arc::new(InMemoryPieceStore::new(5.0, 5.0));
        let origin = Position { x: 0.0, y: 0.0, rotation: 0.0 };
        pieces.seed_puzzle("s1", vec![("p1".to_string(), origin, origin)]);
        let kv = Arc::new(InMemoryKvStore::new());
        let lc = LockCoordinator::new(kv.clone(), pieces.clone(), Duration::from_secs(30));

        lc.acquire("s1", "p1", "conn-a").await.unwrap();
        kv.delete("lock:s1:p1").await.unwrap();
        kv.delete("lock:s1:p1:owner").await.unwrap();

        lc.release_all_for("conn-a").await.unwrap();
        let piece = pieces.get_piece("s1", "p1").await.unwrap().unwrap();
        assert_eq!(piece.lock_owner, None);
    }

    #[tokio::test]
    async fn current_owner_reflects_acquire_and_release() {
        let lc = coordinator();
        assert_eq!(lc.current_owner("s1", "p1").await.unwrap(), None);
        lc.acquire("s1", "p1", "conn-a").await.unwrap();
        assert_eq!(lc.current_owner("s1", "p1").await.unwrap(), Some("conn-a".to_string()));
        lc.release("s1", "p1", "conn-a").await.unwrap();
        assert_eq!(lc.current_owner("s1", "p1").await.unwrap(), None);
    }
}
