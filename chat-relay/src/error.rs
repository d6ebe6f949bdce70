use std::{io, time::Duration};

use thiserror::Error;

use crate::session::SessionId;

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Everything that can end (or spoil) a session.
///
/// Only `MalformedFrame` is tolerated by the reader loop, and only a few times in a row.
/// An unknown unicast target is not an error; the message is dropped.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("payload of {0} bytes does not fit in a frame")]
    FrameTooLarge(usize),

    #[error("cannot decode application message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("message of {0} bytes exceeds the websocket limit")]
    MessageTooLarge(usize),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("no traffic from peer within {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("outbound payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("identity {0} is already registered")]
    IdentityCollision(SessionId),

    #[error("mailbox of session {0} is closed")]
    MailboxClosed(SessionId),

    #[error("mailbox of session {0} stayed full past the delivery timeout")]
    DeliveryTimeout(SessionId),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl RelayError {
    /// Failures the TCP reader may survive by rescanning the stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RelayError::MalformedFrame(_))
    }
}
