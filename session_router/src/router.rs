//! The hub core: validates and dispatches the operation surface of §4.5,
//! owns the per-connection state machine, and orders disconnect cleanup.
//! This is deliberately *just* dispatch — building event payloads lives in
//! `domain`, talking to the chat/session/piece/lock/backplane
//! collaborators lives in their own crates/traits. Splitting those out is
//! the REDESIGN FLAGS fix for the source's single hub that mixed routing,
//! event construction, and adapter calls together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backplane::{Backplane, SubscriptionHandle};
use chrono::{DateTime, Utc};
use connection_registry::ConnectionRegistry;
use cursor_pipeline::CursorHandle;
use lock_coordinator::LockCoordinator;
use parking_lot::Mutex;
use piece_store::{Piece, PieceStore, Position};
use serde::Serialize;
use task_executor::Executor;
use wire::{EventKind, RouterError, ServerFrame};

use crate::chat::ChatRepository;
use crate::directory::{SessionDirectory, SessionStatus};
use crate::domain::{
    ChatMessageEvent, CursorUpdateEvent, Event, ParticipantPlacedCount, PieceLocked, PieceMoved, PieceUnlocked,
    PuzzleCompleted, UserJoined, UserLeft,
};
use crate::outbound::{OutboundReceiver, OutboundRegistry};

const MAX_CHAT_LEN: usize = 1000;
const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct JoinSessionResult {
    pub session_id: String,
    pub puzzle_id: String,
    pub participants: Vec<String>,
    pub completion_ratio: f64,
    pub pieces: Vec<Piece>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MovePieceResult {
    pub piece_id: String,
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
    pub placed: bool,
    pub completed_count: u32,
    pub total_count: u32,
    pub puzzle_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockPieceResult {
    pub piece_id: String,
    pub owner: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SendChatResult {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

struct Attached {
    cursor: CursorHandle,
    cursor_seq: Arc<AtomicU64>,
}

struct SessionSubscription {
    _handle: SubscriptionHandle,
    members: usize,
}

/// Configuration the router needs beyond what its collaborators already
/// carry their own defaults for.
pub struct RouterConfig {
    pub lock_ttl: Duration,
    pub cursor_window: Duration,
}

pub struct SessionRouter<P, C, D> {
    registry: Arc<ConnectionRegistry>,
    locks: Arc<LockCoordinator>,
    pieces: Arc<P>,
    chat: Arc<C>,
    directory: Arc<D>,
    backplane: Backplane,
    outbound: Arc<OutboundRegistry>,
    executor: Executor,
    config: RouterConfig,
    attached: Mutex<HashMap<String, Attached>>,
    subscriptions: Mutex<HashMap<String, SessionSubscription>>,
    sequence: Arc<AtomicU64>,
}

impl<P, C, D> SessionRouter<P, C, D>
where
    P: PieceStore + 'static,
    C: ChatRepository + 'static,
    D: SessionDirectory + 'static,
{
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        locks: Arc<LockCoordinator>,
        pieces: Arc<P>,
        chat: Arc<C>,
        directory: Arc<D>,
        backplane: Backplane,
        executor: Executor,
        config: RouterConfig,
    ) -> Self {
        SessionRouter {
            registry,
            locks,
            pieces,
            chat,
            directory,
            backplane,
            outbound: Arc::new(OutboundRegistry::new()),
            executor,
            config,
            attached: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a freshly accepted transport connection (the `unattached`
    /// state's entry point) and returns the receiver the transport layer
    /// drains to write outbound frames.
    pub async fn register_connection(&self, connection_id: &str, user_id: &str) -> Result<OutboundReceiver, RouterError> {
        self.registry.register(connection_id, user_id).await?;
        Ok(self.outbound.register(connection_id))
    }

    fn user_id_of(&self, connection_id: &str) -> Result<String, RouterError> {
        self.registry
            .lookup_by_connection(connection_id)
            .map(|info| info.user_id)
            .ok_or(RouterError::Internal {
                detail: format!("connection {connection_id} is not registered"),
            })
    }

    /// Validates the `attached` precondition every op but `join-session`
    /// shares, and returns the session id the caller is attached to.
    fn require_attached(&self, connection_id: &str) -> Result<String, RouterError> {
        self.registry
            .lookup_by_connection(connection_id)
            .and_then(|info| info.session_id)
            .ok_or(RouterError::NotInSession)
    }

    async fn ensure_subscribed(&self, session_id: &str) {
        let mut subs = self.subscriptions.lock();
        if let Some(sub) = subs.get_mut(session_id) {
            sub.members += 1;
            return;
        }
        let outbound = self.outbound.clone();
        let registry = self.registry.clone();
        let replica_id = self.backplane.replica_id().to_string();
        let subscribed_session_id = session_id.to_string();
        let handle = self.backplane.subscribe(&self.executor, session_id, move |envelope| {
            // Our own publishes already reached local members synchronously
            // at publish time; replaying them here would double-deliver.
            if envelope.origin_replica_id == replica_id {
                return;
            }
            let Some(name) = envelope.payload.get("name").and_then(|v| v.as_str()) else {
                log::warn!("dropping backplane envelope with no event name");
                return;
            };
            let data = envelope.payload.get("data").cloned().unwrap_or(serde_json::Value::Null);
            let frame = ServerFrame::event_named(name, data);
            outbound.broadcast_to_session(
                &registry,
                &subscribed_session_id,
                Some(&envelope.origin_connection_id),
                &frame,
            );
        });
        subs.insert(
            session_id.to_string(),
            SessionSubscription {
                _handle: handle,
                members: 1,
            },
        );
    }

    fn release_subscription(&self, session_id: &str) {
        let mut subs = self.subscriptions.lock();
        if let Some(sub) = subs.get_mut(session_id) {
            sub.members = sub.members.saturating_sub(1);
            if sub.members == 0 {
                subs.remove(session_id);
            }
        }
    }

    /// Builds the event frame, delivers it to every other local member of
    /// `session_id`, and publishes it to the backplane so other replicas'
    /// members see it too. Publish failures are logged, not surfaced: the
    /// caller's own mutation already succeeded and local delivery already
    /// happened.
    async fn emit(&self, session_id: &str, origin_connection_id: &str, event: Event) {
        let kind = event.kind();
        let payload = event.payload();
        let frame = ServerFrame::event(kind, payload.clone());
        self.outbound
            .broadcast_to_session(&self.registry, session_id, Some(origin_connection_id), &frame);
        let wrapped = serde_json::json!({ "name": kind.name(), "data": payload });
        let seq = self.next_sequence();
        if let Err(err) = self.backplane.publish(session_id, origin_connection_id, seq, wrapped).await {
            log::warn!("backplane publish failed for session {session_id}: {err}");
        }
    }

    fn spawn_cursor_drain(&self, connection_id: String, session_id: String) -> CursorHandle {
        let outbound = self.outbound.clone();
        let registry = self.registry.clone();
        let backplane = self.backplane.clone();
        let sequence = self.sequence.clone();
        cursor_pipeline::spawn_drain(&self.executor, self.config.cursor_window, move |update| {
            let outbound = outbound.clone();
            let registry = registry.clone();
            let backplane = backplane.clone();
            let sequence = sequence.clone();
            let connection_id = connection_id.clone();
            let session_id = session_id.clone();
            async move {
                let payload = serde_json::to_value(CursorUpdateEvent {
                    user_id: update.user_id,
                    x: update.x,
                    y: update.y,
                })
                .expect("cursor update payload is always representable as JSON");
                let frame = ServerFrame::event(EventKind::CursorUpdate, payload.clone());
                outbound.broadcast_to_session(&registry, &session_id, Some(&connection_id), &frame);
                let wrapped = serde_json::json!({ "name": EventKind::CursorUpdate.name(), "data": payload });
                let seq = sequence.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = backplane.publish(&session_id, &connection_id, seq, wrapped).await {
                    log::warn!("backplane publish failed for cursor update in session {session_id}: {err}");
                }
            }
        })
    }

    pub async fn join_session(
        &self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<JoinSessionResult, RouterError> {
        if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
            return Err(RouterError::InvalidSessionId {
                reason: "session id must be 1..=128 characters".to_string(),
            });
        }
        let info = self
            .registry
            .lookup_by_connection(connection_id)
            .ok_or(RouterError::Internal {
                detail: format!("connection {connection_id} is not registered"),
            })?;
        if info.session_id.is_some() {
            return Err(RouterError::AlreadyInSession);
        }
        let snapshot = self
            .directory
            .lookup(session_id)
            .await
            .ok_or(RouterError::SessionNotFound)?;
        if snapshot.status != SessionStatus::Active {
            return Err(RouterError::SessionNotActive);
        }

        self.registry.attach_to_session(connection_id, session_id).await?;
        self.ensure_subscribed(session_id).await;
        let cursor = self.spawn_cursor_drain(connection_id.to_string(), session_id.to_string());
        self.attached.lock().insert(
            connection_id.to_string(),
            Attached {
                cursor,
                cursor_seq: Arc::new(AtomicU64::new(0)),
            },
        );

        self.emit(
            session_id,
            connection_id,
            Event::UserJoined(UserJoined {
                user_id: info.user_id.clone(),
                display_name: info.user_id.clone(),
                timestamp: Utc::now(),
            }),
        )
        .await;

        let pieces = self.pieces.snapshot(session_id).await?;
        let total = pieces.len() as u32;
        let completed = pieces.iter().filter(|p| p.is_placed).count() as u32;
        let completion_ratio = if total == 0 { 0.0 } else { f64::from(completed) / f64::from(total) };
        let participants: Vec<String> = self
            .registry
            .lookup_by_session(session_id)
            .into_iter()
            .filter_map(|cid| self.registry.lookup_by_connection(&cid).map(|info| info.user_id))
            .collect();

        Ok(JoinSessionResult {
            session_id: session_id.to_string(),
            puzzle_id: snapshot.puzzle_id,
            participants,
            completion_ratio,
            pieces,
        })
    }

    /// Runs the cleanup ordering of spec.md §4.5's `draining` state. Used
    /// both by an explicit `leave-session` and by disconnect/idle-sweep,
    /// so a user who is kicked for inactivity converges to the same state
    /// as one who says goodbye politely.
    async fn drain_session(&self, connection_id: &str, session_id: &str, user_id: &str) {
        // (1) remove from the in-memory session index.
        let _ = self.registry.detach_from_session(connection_id).await;
        // (2) release every lock the user's connection held.
        let released = self.locks.release_all_for(connection_id).await.unwrap_or_default();
        // (3) publish user-left.
        self.emit(
            session_id,
            connection_id,
            Event::UserLeft(UserLeft {
                user_id: user_id.to_string(),
                timestamp: Utc::now(),
            }),
        )
        .await;
        for (released_session, piece_id) in released {
            self.emit(
                &released_session,
                connection_id,
                Event::PieceUnlocked(PieceUnlocked {
                    piece_id,
                    by: "system".to_string(),
                }),
            )
            .await;
        }
        // (4) ephemeral K/V records age out via detach_from_session's
        // activity-record refresh (session_id cleared); full deregister on
        // disconnect() deletes the record outright.
        // (5) close the per-connection cursor channel.
        self.attached.lock().remove(connection_id);
        self.release_subscription(session_id);
    }

    pub async fn leave_session(&self, connection_id: &str) -> Result<(), RouterError> {
        let info = self
            .registry
            .lookup_by_connection(connection_id)
            .ok_or(RouterError::NotInSession)?;
        let Some(session_id) = info.session_id else {
            return Err(RouterError::NotInSession);
        };
        self.drain_session(connection_id, &session_id, &info.user_id).await;
        Ok(())
    }

    /// Full teardown on transport close or idle eviction: like
    /// `leave_session`, plus removing the connection (and its outbound
    /// channel and ephemeral K/V activity record) entirely. A connection
    /// that was never attached to a session skips straight to step (4)/(5).
    pub async fn disconnect(&self, connection_id: &str) -> Result<(), RouterError> {
        if let Some(info) = self.registry.lookup_by_connection(connection_id) {
            if let Some(session_id) = &info.session_id {
                self.drain_session(connection_id, session_id, &info.user_id).await;
            }
        }
        self.registry.deregister(connection_id).await?;
        self.outbound.unregister(connection_id);
        Ok(())
    }

    pub async fn move_piece(
        &self,
        connection_id: &str,
        piece_id: &str,
        x: f64,
        y: f64,
        rotation: f64,
    ) -> Result<MovePieceResult, RouterError> {
        let session_id = self.require_attached(connection_id)?;
        if piece_id.is_empty() {
            return Err(RouterError::InvalidPieceId {
                reason: "piece id must not be empty".to_string(),
            });
        }
        let owner = self.locks.current_owner(&session_id, piece_id).await?;
        if let Some(owner) = &owner {
            if owner != connection_id {
                return Err(RouterError::PieceLocked {
                    current_owner: Some(self.display_owner(owner)),
                });
            }
        }

        let outcome = self
            .pieces
            .update_position(&session_id, piece_id, Position { x, y, rotation })
            .await?;

        if owner.as_deref() == Some(connection_id) {
            // Any successful mutation by the owner implicitly extends the lock.
            let _ = self.locks.extend(&session_id, piece_id, connection_id).await;
        }

        let user_id = self.user_id_of(connection_id)?;
        self.emit(
            &session_id,
            connection_id,
            Event::PieceMoved(PieceMoved {
                piece_id: piece_id.to_string(),
                x: outcome.new_position.x,
                y: outcome.new_position.y,
                rotation: outcome.new_position.rotation,
                mover: user_id.clone(),
                placed: outcome.is_placed,
                timestamp: Utc::now(),
            }),
        )
        .await;

        if outcome.puzzle_complete {
            self.announce_completion(&session_id).await;
        }

        Ok(MovePieceResult {
            piece_id: piece_id.to_string(),
            x: outcome.new_position.x,
            y: outcome.new_position.y,
            rotation: outcome.new_position.rotation,
            placed: outcome.is_placed,
            completed_count: outcome.completed_count,
            total_count: outcome.total_count,
            puzzle_complete: outcome.puzzle_complete,
        })
    }

    async fn announce_completion(&self, session_id: &str) {
        let pieces = match self.pieces.snapshot(session_id).await {
            Ok(pieces) => pieces,
            Err(err) => {
                log::error!("failed to snapshot pieces for completion announcement: {err}");
                return;
            }
        };
        // Placement isn't attributed to a specific mover once it has
        // happened; this reports raw placed-piece counts per piece, not
        // per participant, since the durable store (out of scope here)
        // owns per-user attribution history.
        let placed_count = pieces.iter().filter(|p| p.is_placed).count() as u32;
        let participants: Vec<ParticipantPlacedCount> = self
            .registry
            .lookup_by_session(session_id)
            .into_iter()
            .filter_map(|cid| self.registry.lookup_by_connection(&cid).map(|info| info.user_id))
            .map(|user_id| ParticipantPlacedCount {
                user_id,
                placed_count,
            })
            .collect();
        self.emit(
            session_id,
            "",
            Event::PuzzleCompleted(PuzzleCompleted {
                total_time_seconds: 0,
                participants,
            }),
        )
        .await;
    }

    fn display_owner(&self, connection_id: &str) -> String {
        self.registry
            .lookup_by_connection(connection_id)
            .map(|info| info.user_id)
            .unwrap_or_else(|| connection_id.to_string())
    }

    pub async fn lock_piece(&self, connection_id: &str, piece_id: &str) -> Result<LockPieceResult, RouterError> {
        let session_id = self.require_attached(connection_id)?;
        if self.pieces.get_piece(&session_id, piece_id).await?.is_none() {
            return Err(RouterError::PieceNotFound);
        }
        match self.locks.acquire(&session_id, piece_id, connection_id).await {
            Ok(()) => {
                let user_id = self.user_id_of(connection_id)?;
                let expiry = Utc::now() + self.config.lock_ttl;
                self.emit(
                    &session_id,
                    connection_id,
                    Event::PieceLocked(PieceLocked {
                        piece_id: piece_id.to_string(),
                        owner: user_id.clone(),
                        expiry,
                    }),
                )
                .await;
                Ok(LockPieceResult {
                    piece_id: piece_id.to_string(),
                    owner: user_id,
                    expiry,
                })
            }
            Err(RouterError::PieceLocked { current_owner }) => Err(RouterError::PieceLocked {
                current_owner: current_owner.map(|owner| self.display_owner(&owner)),
            }),
            Err(err) => Err(err),
        }
    }

    pub async fn unlock_piece(&self, connection_id: &str, piece_id: &str) -> Result<(), RouterError> {
        let session_id = self.require_attached(connection_id)?;
        self.locks.release(&session_id, piece_id, connection_id).await?;
        let user_id = self.user_id_of(connection_id)?;
        self.emit(
            &session_id,
            connection_id,
            Event::PieceUnlocked(PieceUnlocked {
                piece_id: piece_id.to_string(),
                by: user_id,
            }),
        )
        .await;
        Ok(())
    }

    pub async fn send_chat(&self, connection_id: &str, text: &str) -> Result<SendChatResult, RouterError> {
        let session_id = self.require_attached(connection_id)?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(RouterError::EmptyMessage);
        }
        if trimmed.chars().count() > MAX_CHAT_LEN {
            return Err(RouterError::MessageTooLong {
                max: MAX_CHAT_LEN,
                actual: trimmed.chars().count(),
            });
        }
        let user_id = self.user_id_of(connection_id)?;
        let message = self
            .chat
            .persist(&session_id, &user_id, trimmed)
            .await
            .map_err(|detail| RouterError::StoreUnavailable { detail })?;

        // The sender sees its own message once, authoritatively ordered:
        // it is not excluded from the fan-out the way mutation events
        // exclude their origin.
        let payload = serde_json::to_value(ChatMessageEvent {
            message_id: message.message_id.clone(),
            user_id: message.user_id.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
        })
        .expect("chat payload is always representable as JSON");
        let frame = ServerFrame::event(EventKind::ChatMessage, payload.clone());
        self.outbound.broadcast_to_session(&self.registry, &session_id, None, &frame);
        let wrapped = serde_json::json!({ "name": EventKind::ChatMessage.name(), "data": payload });
        let seq = self.next_sequence();
        if let Err(err) = self.backplane.publish(&session_id, connection_id, seq, wrapped).await {
            log::warn!("backplane publish failed for session {session_id}: {err}");
        }

        Ok(SendChatResult {
            message_id: message.message_id,
            timestamp: message.timestamp,
        })
    }

    /// Enqueues a cursor sample for coalescing. Never fails visibly: an
    /// unattached caller's sample is silently dropped, matching spec.md's
    /// "never fails visibly to the caller".
    pub fn cursor(&self, connection_id: &str, x: f64, y: f64) {
        let Some(info) = self.registry.lookup_by_connection(connection_id) else {
            return;
        };
        let Some(session_id) = info.session_id else {
            return;
        };
        let attached = self.attached.lock();
        let Some(state) = attached.get(connection_id) else {
            return;
        };
        let sequence = state.cursor_seq.fetch_add(1, Ordering::Relaxed);
        state.cursor.publish(cursor_pipeline::CursorUpdate {
            connection_id: connection_id.to_string(),
            session_id,
            user_id: info.user_id,
            x,
            y,
            sequence,
        });
    }

    /// Connections whose liveness has lapsed, for the background sweeper
    /// to disconnect through the same cleanup path as an explicit close.
    pub fn find_stale_connections(&self, idle_timeout: Duration) -> Vec<String> {
        self.registry.find_stale(idle_timeout)
    }

    pub async fn touch(&self, connection_id: &str) -> Result<(), RouterError> {
        self.registry.touch(connection_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;
    use crate::directory::SessionSnapshot;
    use async_trait::async_trait;
    use kv_store::InMemoryKvStore;
    use parking_lot::Mutex as SyncMutex;
    use piece_store::InMemoryPieceStore;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::time::Duration as StdDuration;

    struct StubChat {
        next_id: StdAtomicU64,
        sent: SyncMutex<Vec<ChatMessage>>,
    }

    impl StubChat {
        fn new() -> Self {
            StubChat {
                next_id: StdAtomicU64::new(0),
                sent: SyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatRepository for StubChat {
        async fn persist(&self, session_id: &str, user_id: &str, text: &str) -> Result<ChatMessage, String> {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let message = ChatMessage {
                message_id: format!("msg-{id}"),
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                text: text.to_string(),
                timestamp: Utc::now(),
            };
            self.sent.lock().push(message.clone());
            Ok(message)
        }
    }

    struct StubDirectory {
        sessions: SyncMutex<HashMap<String, SessionSnapshot>>,
    }

    impl StubDirectory {
        fn new() -> Self {
            StubDirectory {
                sessions: SyncMutex::new(HashMap::new()),
            }
        }

        fn seed(&self, session_id: &str, puzzle_id: &str, status: SessionStatus) {
            self.sessions.lock().insert(
                session_id.to_string(),
                SessionSnapshot {
                    session_id: session_id.to_string(),
                    puzzle_id: puzzle_id.to_string(),
                    status,
                },
            );
        }
    }

    #[async_trait]
    impl SessionDirectory for StubDirectory {
        async fn lookup(&self, session_id: &str) -> Option<SessionSnapshot> {
            self.sessions.lock().get(session_id).cloned()
        }
    }

    type TestRouter = SessionRouter<InMemoryPieceStore, StubChat, StubDirectory>;

    fn test_router() -> Arc<TestRouter> {
        test_router_on(Arc::new(InMemoryKvStore::new()), "replica-1")
    }

    fn test_router_on(kv: Arc<InMemoryKvStore>, replica_id: &str) -> Arc<TestRouter> {
        let kv: Arc<dyn kv_store::KvStore> = kv;
        let registry = Arc::new(ConnectionRegistry::new(4, kv.clone()));
        let pieces = Arc::new(InMemoryPieceStore::new(5.0, 5.0));
        let locks = Arc::new(LockCoordinator::new(kv.clone(), pieces.clone(), StdDuration::from_secs(30)));
        let chat = Arc::new(StubChat::new());
        let directory = Arc::new(StubDirectory::new());
        let backplane = Backplane::new(kv, "puzzle-hub".to_string(), replica_id.to_string());
        let executor = Executor::borrowed();
        let config = RouterConfig {
            lock_ttl: StdDuration::from_secs(30),
            cursor_window: StdDuration::from_millis(50),
        };
        Arc::new(SessionRouter::new(registry, locks, pieces, chat, directory, backplane, executor, config))
    }

    async fn join(router: &TestRouter, connection_id: &str, user_id: &str, session_id: &str) -> JoinSessionResult {
        router.directory.seed(session_id, "puzzle-1", SessionStatus::Active);
        router.register_connection(connection_id, user_id).await.unwrap();
        router.join_session(connection_id, session_id).await.unwrap()
    }

    #[tokio::test]
    async fn join_unknown_session_is_rejected() {
        let router = test_router();
        router.register_connection("c1", "u1").await.unwrap();
        let err = router.join_session("c1", "missing").await.unwrap_err();
        assert!(matches!(err, RouterError::SessionNotFound));
    }

    #[tokio::test]
    async fn join_pending_session_is_rejected() {
        let router = test_router();
        router.directory.seed("s1", "puzzle-1", SessionStatus::Pending);
        router.register_connection("c1", "u1").await.unwrap();
        let err = router.join_session("c1", "s1").await.unwrap_err();
        assert!(matches!(err, RouterError::SessionNotActive));
    }

    #[tokio::test]
    async fn double_join_is_rejected() {
        let router = test_router();
        join(&router, "c1", "u1", "s1").await;
        let err = router.join_session("c1", "s1").await.unwrap_err();
        assert!(matches!(err, RouterError::AlreadyInSession));
    }

    #[tokio::test]
    async fn lock_move_unlock_happy_path() {
        let router = test_router();
        router.pieces.seed_puzzle(
            "s1",
            vec![("p1".to_string(), Position { x: 100.0, y: 100.0, rotation: 0.0 }, Position { x: 0.0, y: 0.0, rotation: 0.0 })],
        );
        join(&router, "c1", "alice", "s1").await;

        let lock = router.lock_piece("c1", "p1").await.unwrap();
        assert_eq!(lock.owner, "alice");

        let moved = router.move_piece("c1", "p1", 99.0, 100.0, 1.0).await.unwrap();
        assert!(moved.placed);
        assert!(moved.puzzle_complete);

        router.unlock_piece("c1", "p1").await.unwrap();
        assert_eq!(router.locks.current_owner("s1", "p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_connection_cannot_move_a_locked_piece() {
        let router = test_router();
        router.pieces.seed_puzzle(
            "s1",
            vec![("p1".to_string(), Position { x: 100.0, y: 100.0, rotation: 0.0 }, Position { x: 0.0, y: 0.0, rotation: 0.0 })],
        );
        join(&router, "c1", "alice", "s1").await;
        join(&router, "c2", "bob", "s1").await;

        router.lock_piece("c1", "p1").await.unwrap();
        let err = router.move_piece("c2", "p1", 10.0, 10.0, 0.0).await.unwrap_err();
        match err {
            RouterError::PieceLocked { current_owner } => assert_eq!(current_owner.as_deref(), Some("alice")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn locking_an_unseeded_piece_is_rejected() {
        let router = test_router();
        join(&router, "c1", "alice", "s1").await;
        let err = router.lock_piece("c1", "missing-piece").await.unwrap_err();
        assert!(matches!(err, RouterError::PieceNotFound));
    }

    #[tokio::test]
    async fn disconnect_releases_locks_for_the_next_owner() {
        let router = test_router();
        router.pieces.seed_puzzle(
            "s1",
            vec![("p1".to_string(), Position { x: 100.0, y: 100.0, rotation: 0.0 }, Position { x: 0.0, y: 0.0, rotation: 0.0 })],
        );
        join(&router, "c1", "alice", "s1").await;
        join(&router, "c2", "bob", "s1").await;

        router.lock_piece("c1", "p1").await.unwrap();
        router.disconnect("c1").await.unwrap();

        router.lock_piece("c2", "p1").await.unwrap();
        assert_eq!(router.locks.current_owner("s1", "p1").await.unwrap(), Some("c2".to_string()));
    }

    #[tokio::test]
    async fn disconnect_announces_a_system_unlock_for_each_released_piece() {
        let router = test_router();
        router.pieces.seed_puzzle(
            "s1",
            vec![("p1".to_string(), Position { x: 100.0, y: 100.0, rotation: 0.0 }, Position { x: 0.0, y: 0.0, rotation: 0.0 })],
        );
        join(&router, "c1", "alice", "s1").await;
        let mut rx2 = router.register_connection("c2", "bob").await.unwrap();
        router.directory.seed("s1", "puzzle-1", SessionStatus::Active);
        router.registry.attach_to_session("c2", "s1").await.unwrap();

        router.lock_piece("c1", "p1").await.unwrap();
        router.disconnect("c1").await.unwrap();

        let mut saw_system_unlock = false;
        for _ in 0..4 {
            let Ok(Some(frame)) = tokio::time::timeout(StdDuration::from_millis(100), rx2.recv()).await else {
                break;
            };
            if let ServerFrame::Event { name, result, .. } = frame {
                if name == "piece-unlocked" {
                    assert_eq!(result["by"], "system");
                    saw_system_unlock = true;
                }
            }
        }
        assert!(saw_system_unlock, "expected a system-attributed piece-unlocked event");
    }

    #[tokio::test]
    async fn puzzle_completion_fires_once_across_two_pieces() {
        let router = test_router();
        router.pieces.seed_puzzle(
            "s1",
            vec![
                (
                    "p1".to_string(),
                    Position { x: 0.0, y: 0.0, rotation: 0.0 },
                    Position { x: 500.0, y: 500.0, rotation: 0.0 },
                ),
                (
                    "p2".to_string(),
                    Position { x: 100.0, y: 100.0, rotation: 0.0 },
                    Position { x: 500.0, y: 500.0, rotation: 0.0 },
                ),
            ],
        );
        let mut events = {
            router.directory.seed("s1", "puzzle-1", SessionStatus::Active);
            router.register_connection("c1", "alice").await.unwrap();
            let rx = router.outbound.register("c1");
            router.registry.attach_to_session("c1", "s1").await.unwrap();
            rx
        };

        let first = router.move_piece("c1", "p1", 1.0, 1.0, 0.0).await.unwrap();
        assert!(first.placed);
        assert!(!first.puzzle_complete);

        // Placement is sticky: moving back off-target does not un-place it,
        // and the completion count does not regress.
        let second = router.move_piece("c1", "p1", 50.0, 50.0, 0.0).await.unwrap();
        assert!(second.placed);
        assert!(!second.puzzle_complete);

        let third = router.move_piece("c1", "p2", 99.0, 100.0, 1.0).await.unwrap();
        assert!(third.placed);
        assert!(third.puzzle_complete);

        // A further move after completion must not re-fire puzzle_complete
        // or emit a second puzzle-completed event.
        let fourth = router.move_piece("c1", "p2", 300.0, 300.0, 0.0).await.unwrap();
        assert!(fourth.placed, "placement must not regress once achieved");
        assert!(!fourth.puzzle_complete);

        let mut completed_count = 0;
        while let Ok(frame) = events.try_recv() {
            if let ServerFrame::Event { name, .. } = frame {
                if name == "puzzle-completed" {
                    completed_count += 1;
                }
            }
        }
        assert_eq!(completed_count, 1, "puzzle-completed must be emitted exactly once");
    }

    #[tokio::test]
    async fn chat_is_delivered_to_sender_and_other_members() {
        let router = test_router();
        join(&router, "c1", "alice", "s1").await;
        let mut rx2 = {
            router.directory.seed("s1", "puzzle-1", SessionStatus::Active);
            router.register_connection("c2", "bob").await.unwrap();
            let rx = router.outbound.register("c2");
            router.registry.attach_to_session("c2", "s1").await.unwrap();
            rx
        };

        let result = router.send_chat("c1", "  hello there  ").await.unwrap();
        assert!(!result.message_id.is_empty());

        let frame = rx2.recv().await.expect("bob should see the chat message");
        match frame {
            ServerFrame::Event { name, result, .. } => {
                assert_eq!(name, "chat-message");
                assert_eq!(result["text"], "hello there");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_chat_message_is_rejected() {
        let router = test_router();
        join(&router, "c1", "alice", "s1").await;
        let err = router.send_chat("c1", "   ").await.unwrap_err();
        assert!(matches!(err, RouterError::EmptyMessage));
    }

    #[tokio::test]
    async fn cursor_before_join_is_silently_ignored() {
        let router = test_router();
        router.register_connection("c1", "u1").await.unwrap();
        router.cursor("c1", 1.0, 2.0);
    }

    #[tokio::test]
    async fn events_fan_out_across_replicas_sharing_a_backplane() {
        let kv = Arc::new(InMemoryKvStore::new());
        let router_a = test_router_on(kv.clone(), "replica-a");
        let router_b = test_router_on(kv, "replica-b");

        router_a.directory.seed("s1", "puzzle-1", SessionStatus::Active);
        router_b.directory.seed("s1", "puzzle-1", SessionStatus::Active);
        router_a.pieces.seed_puzzle(
            "s1",
            vec![("p1".to_string(), Position { x: 100.0, y: 100.0, rotation: 0.0 }, Position { x: 0.0, y: 0.0, rotation: 0.0 })],
        );
        router_b.pieces.seed_puzzle(
            "s1",
            vec![("p1".to_string(), Position { x: 100.0, y: 100.0, rotation: 0.0 }, Position { x: 0.0, y: 0.0, rotation: 0.0 })],
        );

        router_a.register_connection("c1", "alice").await.unwrap();
        router_a.join_session("c1", "s1").await.unwrap();
        let mut rx2 = router_b.register_connection("c2", "bob").await.unwrap();
        router_b.join_session("c2", "s1").await.unwrap();

        // Give the cross-replica subscription a moment to establish before publishing.
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        router_a.lock_piece("c1", "p1").await.unwrap();

        let frame = tokio::time::timeout(StdDuration::from_millis(200), rx2.recv())
            .await
            .expect("replica b should observe replica a's lock event")
            .expect("channel should stay open");
        match frame {
            ServerFrame::Event { name, .. } => assert_eq!(name, "piece-locked"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
