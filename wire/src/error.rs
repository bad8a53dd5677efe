use std::fmt;

/// Every error the router can return to a client, one variant per wire error code.
///
/// The `Display` impl produces the human-readable `message`; `code()` produces the
/// machine-readable `code` string from §6 of the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    InvalidSessionId { reason: String },
    SessionNotFound,
    SessionNotActive,
    AlreadyInSession,
    NotInSession,
    InvalidPieceId { reason: String },
    PieceNotFound,
    PieceLocked { current_owner: Option<String> },
    NotOwner,
    EmptyMessage,
    MessageTooLong { max: usize, actual: usize },
    Timeout,
    StoreUnavailable { detail: String },
    Unauthorized,
    ShuttingDown,
    Internal { detail: String },
}

impl RouterError {
    /// The machine-readable `code` field of the wire error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::InvalidSessionId { .. } => "InvalidSessionId",
            RouterError::SessionNotFound => "SessionNotFound",
            RouterError::SessionNotActive => "SessionNotActive",
            RouterError::AlreadyInSession => "AlreadyInSession",
            RouterError::NotInSession => "NotInSession",
            RouterError::InvalidPieceId { .. } => "InvalidPieceId",
            RouterError::PieceNotFound => "PieceNotFound",
            RouterError::PieceLocked { .. } => "PieceLocked",
            RouterError::NotOwner => "NotOwner",
            RouterError::EmptyMessage => "EmptyMessage",
            RouterError::MessageTooLong { .. } => "MessageTooLong",
            RouterError::Timeout => "Timeout",
            RouterError::StoreUnavailable { .. } => "StoreUnavailable",
            RouterError::Unauthorized => "Unauthorized",
            RouterError::ShuttingDown => "ShuttingDown",
            RouterError::Internal { .. } => "Internal",
        }
    }

    /// The current lock owner, for `PieceLocked` responses. `None` for every other variant.
    pub fn current_owner(&self) -> Option<&str> {
        match self {
            RouterError::PieceLocked { current_owner } => current_owner.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::InvalidSessionId { reason } => {
                write!(f, "invalid session id: {reason}")
            }
            RouterError::SessionNotFound => write!(f, "session not found"),
            RouterError::SessionNotActive => write!(f, "session is not active"),
            RouterError::AlreadyInSession => write!(f, "connection is already attached to a session"),
            RouterError::NotInSession => write!(f, "connection is not attached to a session"),
            RouterError::InvalidPieceId { reason } => write!(f, "invalid piece id: {reason}"),
            RouterError::PieceNotFound => write!(f, "piece not found"),
            RouterError::PieceLocked { current_owner } => match current_owner {
                Some(owner) => write!(f, "piece is locked by {owner}"),
                None => write!(f, "piece is locked"),
            },
            RouterError::NotOwner => write!(f, "caller does not own the lock"),
            RouterError::EmptyMessage => write!(f, "chat message must not be empty"),
            RouterError::MessageTooLong { max, actual } => {
                write!(f, "chat message of {actual} chars exceeds the {max} char limit")
            }
            RouterError::Timeout => write!(f, "operation exceeded its deadline"),
            RouterError::StoreUnavailable { detail } => write!(f, "store unavailable: {detail}"),
            RouterError::Unauthorized => write!(f, "unauthorized"),
            RouterError::ShuttingDown => write!(f, "server is shutting down"),
            RouterError::Internal { detail } => write!(f, "internal error: {detail}"),
        }
    }
}

impl std::error::Error for RouterError {}
