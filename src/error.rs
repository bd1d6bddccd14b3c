//! Error types for the reliable transport.

use thiserror::Error;

use crate::message::{MessageError, MessageType};

/// Errors surfaced by the reliable transport.
///
/// The error is `Clone` because a single failure completes every queued
/// send: collapse hands the same terminal error to all waiters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport has shut down; no further sends or receives are
    /// possible and the owning tunnel should be torn down.
    #[error("transport is down")]
    Down,

    /// Retransmission gave up waiting for an acknowledgement.
    #[error("transmit of {0} failed after {1} retry attempts")]
    TransmitFailed(MessageType, u32),

    /// Message encode, decode, or synthesis failure.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// An inbound message acknowledged beyond what we have sent; its
    /// whole datagram is dropped.
    #[error("invalid packet: peer nr {nr} is ahead of local ns {ns}")]
    SequenceCheck {
        /// The peer's Nr value.
        nr: u16,
        /// Our next-send sequence number.
        ns: u16,
    },

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}
