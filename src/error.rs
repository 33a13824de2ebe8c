use std::net::SocketAddr;

use thiserror::Error;

use crate::metrics::MetricsSnapshot;
use crate::wire::control::{CommandType, RejectReason};
use crate::wire::ConnId;

/// Malformed wire bytes. Packets failing to decode are dropped at the codec boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated buffer: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("declared payload length {declared} does not match actual length {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("checksum mismatch: packet carries {expected:08x}, payload has {actual:08x}")]
pub struct IntegrityError {
    pub expected: u32,
    pub actual: u32,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{command:?} command undelivered: no reply after {attempts} attempts")]
    CommandUndelivered { command: CommandType, attempts: u32 },
    #[error("{0:?} command was superseded by a newer command")]
    CommandCancelled(CommandType),
    #[error("command rejected by server: {0}")]
    Rejected(RejectReason),
    #[error("session limit of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error("endpoint {0} is already used by an active session")]
    PortInUse(SocketAddr),
    #[error("unknown session {0}")]
    UnknownSession(ConnId),
    #[error("unknown video {0:?}")]
    UnknownVideo(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed request: {0}")]
    Malformed(#[from] DecodeError),
    #[error("a stream is already playing")]
    AlreadyPlaying,
    #[error("no stream is playing")]
    NotPlaying,
    /// Playback ended locally, but the server may still be streaming
    #[error("stream stopped locally, but the server was not told: {cause}")]
    StoppedLocally { metrics: Box<MetricsSnapshot>, cause: Box<StreamError> },
    #[error("cannot receive media on port {port}: {reason}")]
    MediaPortUnavailable { port: u16, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// The reason code sent back to a peer whose command failed with this error
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            StreamError::CapacityExceeded { .. } => RejectReason::CapacityExceeded,
            StreamError::PortInUse(_) => RejectReason::PortInUse,
            StreamError::UnknownVideo(_) => RejectReason::UnknownVideo,
            StreamError::Rejected(reason) => *reason,
            _ => RejectReason::InvalidRequest,
        }
    }
}
