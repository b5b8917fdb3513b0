use huddle_protocol::{MediaKind, ProtocolError, RequestId};
use std::time::Duration;
use thiserror::Error;

use crate::room::RoomState;

/// Failure of a single signaling request or of the connection itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request {id} timed out after {timeout:?}")]
    Timeout { id: RequestId, timeout: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer answered with `ok: false`
    #[error("Request rejected ({code}): {reason}")]
    Rejected { code: i64, reason: String },
}

impl From<ProtocolError> for SignalingError {
    fn from(err: ProtocolError) -> Self {
        SignalingError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::Protocol(err.to_string())
    }
}

/// Failure reported by the media engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device not loaded")]
    NotLoaded,

    #[error("Cannot produce {0}")]
    CannotProduce(MediaKind),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Media engine error: {0}")]
    Engine(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid room state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: RoomState,
        actual: RoomState,
    },

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Room session is no longer running")]
    ActorGone,
}

pub type Result<T> = std::result::Result<T, SessionError>;
