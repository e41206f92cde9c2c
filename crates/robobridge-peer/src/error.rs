use std::time::Duration;

use robobridge_frame::StreamId;
use robobridge_message::{AbortStatus, Category};

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] robobridge_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] robobridge_frame::FrameError),

    /// A payload or acknowledgement could not be encoded or decoded.
    #[error("message error: {0}")]
    Message(#[from] robobridge_message::MessageError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server refused the connection (for example, it is at capacity).
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// Peer disconnected or the connection was reset.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The stream was closed, locally or by the peer.
    #[error("channel closed")]
    ChannelClosed,

    /// A send stayed blocked on backpressure for the whole send timeout.
    #[error("stream {stream} still full after {waited:?}")]
    ChannelFull { stream: StreamId, waited: Duration },

    /// The category was not negotiated on this connection.
    #[error("category {0} not negotiated with peer")]
    UnsupportedCategory(Category),

    /// Every data stream id on this connection has been used.
    #[error("stream ids exhausted on this connection")]
    StreamIdsExhausted,

    /// The peer aborted the stream.
    #[error("stream aborted by peer: {0}")]
    Aborted(AbortStatus),

    /// A frame processor failed while handling a payload.
    #[error("processing failed: {0}")]
    Processing(String),

    /// The peer sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An operation was called in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Graceful shutdown failed.
    #[error("shutdown failed: {0}")]
    ShutdownFailed(String),
}

impl PeerError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PeerError::ChannelFull { .. } | PeerError::Timeout(_))
    }
}

/// Error returned by a [`FrameProcessor`](crate::consumer::FrameProcessor).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProcessingError(String);

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
