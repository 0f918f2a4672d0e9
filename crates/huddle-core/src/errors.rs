//! Error taxonomy for the room broadcast engine.
//!
//! Every failure a connection can observe maps onto one [`ChatError`]
//! variant. Each variant has a stable wire code (see [`ChatError::code`])
//! and is either fatal to the connection or recoverable per message
//! (see [`ChatError::is_fatal`]).

use thiserror::Error;

/// Errors surfaced by the room registry, the frame protocol, and the router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Room name was blank or contained forbidden characters.
    #[error("invalid room name: {0}")]
    InvalidRoomName(String),

    /// A frame arrived that the connection's protocol state does not allow.
    #[error("unexpected {got} frame while {state}")]
    UnexpectedFrame {
        /// Protocol state the connection was in.
        state: &'static str,
        /// Kind of frame that arrived.
        got: &'static str,
    },

    /// A frame could not be parsed or failed validation.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The file storage collaborator rejected a completed upload.
    #[error("file storage failed: {0}")]
    StorageFailed(String),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,
}

impl ChatError {
    /// Machine-readable code sent to clients in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRoomName(_) => "INVALID_ROOM_NAME",
            Self::UnexpectedFrame { .. } => "UNEXPECTED_FRAME",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::StorageFailed(_) => "STORAGE_FAILED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Closed => "CLOSED",
        }
    }

    /// Whether this error terminates the connection that produced it.
    ///
    /// `MalformedFrame` and `StorageFailed` are per-message and leave the
    /// connection open.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedFrame { .. } | Self::Transport(_) | Self::Closed
        )
    }
}
