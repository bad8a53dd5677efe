//! Dispatches the wire operation surface against the collaborating
//! adapters (piece store, lock coordinator, connection registry, chat
//! repository, session directory, backplane) and emits the resulting
//! domain events to a session's membership, locally and cross-replica.

pub mod chat;
pub mod directory;
pub mod domain;
pub mod outbound;
mod router;

pub use chat::{ChatMessage, ChatRepository};
pub use directory::{SessionDirectory, SessionSnapshot, SessionStatus};
pub use domain::{
    ChatMessageEvent, CursorUpdateEvent, Event, ParticipantPlacedCount, PieceLocked, PieceMoved, PieceUnlocked,
    PuzzleCompleted, UserJoined, UserLeft,
};
pub use outbound::{OutboundReceiver, OutboundRegistry, OutboundSender};
pub use router::{JoinSessionResult, LockPieceResult, MovePieceResult, RouterConfig, SendChatResult, SessionRouter};
