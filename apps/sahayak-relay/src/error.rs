use std::time::Duration;

use thiserror::Error;

use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Connect, read or write failure on an upstream connection. Terminal for
    /// that connection.
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream did not acknowledge setup within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {session} unavailable: {reason}")]
    SessionDegraded { session: SessionId, reason: String },
    #[error("failed to decode upstream frame: {0}")]
    Decode(#[from] live_proto::DecodeError),
    #[error("failed to encode upstream frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl RelayError {
    pub fn transport(reason: impl Into<String>) -> Self {
        RelayError::Transport(reason.into())
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::Transport(_) => "transport",
            RelayError::HandshakeTimeout(_) => "handshake_timeout",
            RelayError::SessionNotFound(_) => "session_not_found",
            RelayError::SessionDegraded { .. } => "session_degraded",
            RelayError::Decode(_) => "decode",
            RelayError::Encode(_) => "encode",
            RelayError::InvalidPayload(_) => "invalid_payload",
        }
    }

    /// `subType` used when this error is reported to the browser.
    pub fn envelope_sub_type(&self) -> &'static str {
        match self {
            RelayError::SessionNotFound(_) | RelayError::SessionDegraded { .. } => "session",
            RelayError::Transport(_) | RelayError::HandshakeTimeout(_) => "upstream",
            RelayError::Decode(_) | RelayError::Encode(_) => "processing",
            RelayError::InvalidPayload(_) => "payload",
        }
    }
}
