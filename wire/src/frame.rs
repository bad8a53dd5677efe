use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RouterError;

/// The `op` field of a client → server frame (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Op {
    JoinSession,
    LeaveSession,
    MovePiece,
    LockPiece,
    UnlockPiece,
    SendChat,
    Cursor,
}

/// The `name` field of a server → client event frame (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    UserJoined,
    UserLeft,
    PieceMoved,
    PieceLocked,
    PieceUnlocked,
    ChatMessage,
    CursorUpdate,
    PuzzleCompleted,
}

/// A frame received from a client: `{ "op", "seq", "args" }`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub op: String,
    pub seq: u64,
    #[serde(default)]
    pub args: Value,
}

/// A frame sent to a client: either a `response` (echoing a request `seq`) or an
/// unsolicited `event`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerFrame {
    Response {
        seq: u64,
        name: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    Event {
        name: String,
        ok: bool,
        result: Value,
    },
}

/// The `{ "code", "message" }` shape of an error result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_owner: Option<String>,
}

impl From<&RouterError> for WireError {
    fn from(err: &RouterError) -> Self {
        WireError {
            code: err.code().to_string(),
            message: err.to_string(),
            current_owner: err.current_owner().map(str::to_string),
        }
    }
}

impl ServerFrame {
    pub fn ok(seq: u64, op: Op, result: Value) -> Self {
        ServerFrame::Response {
            seq,
            name: op_name(op).to_string(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(seq: u64, op: Op, error: &RouterError) -> Self {
        ServerFrame::Response {
            seq,
            name: op_name(op).to_string(),
            ok: false,
            result: None,
            error: Some(WireError::from(error)),
        }
    }

    pub fn event(kind: EventKind, payload: Value) -> Self {
        ServerFrame::Event {
            name: event_name(kind).to_string(),
            ok: true,
            result: payload,
        }
    }

    /// Builds an event frame from a raw wire name rather than an
    /// `EventKind`. Used when replaying an event a different replica
    /// already named on the wire (the backplane envelope), where only the
    /// string survived the hop, not the enum.
    pub fn event_named(name: impl Into<String>, payload: Value) -> Self {
        ServerFrame::Event {
            name: name.into(),
            ok: true,
            result: payload,
        }
    }
}

fn op_name(op: Op) -> &'static str {
    op.name()
}

fn event_name(kind: EventKind) -> &'static str {
    kind.name()
}

impl Op {
    /// Parse the `op` field of a client frame. Unknown ops are the caller's responsibility
    /// to reject (there is no `UnknownOp` wire error code in §6, so callers degrade to
    /// `Internal` or drop the frame, per the transport implementation).
    pub fn parse(s: &str) -> Option<Op> {
        match s {
            "join-session" => Some(Op::JoinSession),
            "leave-session" => Some(Op::LeaveSession),
            "move-piece" => Some(Op::MovePiece),
            "lock-piece" => Some(Op::LockPiece),
            "unlock-piece" => Some(Op::UnlockPiece),
            "send-chat" => Some(Op::SendChat),
            "cursor" => Some(Op::Cursor),
            _ => None,
        }
    }

    /// The wire `op`/`name` string for this operation.
    pub fn name(self) -> &'static str {
        match self {
            Op::JoinSession => "join-session",
            Op::LeaveSession => "leave-session",
            Op::MovePiece => "move-piece",
            Op::LockPiece => "lock-piece",
            Op::UnlockPiece => "unlock-piece",
            Op::SendChat => "send-chat",
            Op::Cursor => "cursor",
        }
    }
}

impl EventKind {
    /// The wire `name` string for this event.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::UserJoined => "user-joined",
            EventKind::UserLeft => "user-left",
            EventKind::PieceMoved => "piece-moved",
            EventKind::PieceLocked => "piece-locked",
            EventKind::PieceUnlocked => "piece-unlocked",
            EventKind::ChatMessage => "chat-message",
            EventKind::CursorUpdate => "cursor-update",
            EventKind::PuzzleCompleted => "puzzle-completed",
        }
    }
}
