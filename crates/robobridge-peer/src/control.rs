use bytes::Bytes;
use robobridge_frame::{Frame, FrameKind, CONTROL_STREAM};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// CONTROL message type: ping request.
pub const CONTROL_PING: &str = "ping";
/// CONTROL message type: ping response.
pub const CONTROL_PONG: &str = "pong";
/// CONTROL message type: graceful shutdown request.
pub const CONTROL_SHUTDOWN_REQUEST: &str = "shutdown_request";
/// CONTROL message type: graceful shutdown acknowledgement.
pub const CONTROL_SHUTDOWN_ACK: &str = "shutdown_ack";
/// CONTROL message type: connection refused by the server.
pub const CONTROL_REJECT: &str = "reject";

/// CONTROL stream message payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ControlMessage {
    fn bare(msg_type: &str) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            payload: None,
        }
    }

    fn with_reason(msg_type: &str, reason: Option<&str>) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            payload: reason.map(|reason| serde_json::json!({ "reason": reason })),
        }
    }

    /// Create a ping message.
    pub fn ping() -> Self {
        Self::bare(CONTROL_PING)
    }

    /// Create a pong message.
    pub fn pong() -> Self {
        Self::bare(CONTROL_PONG)
    }

    /// Create a shutdown request.
    pub fn shutdown_request(reason: Option<&str>) -> Self {
        Self::with_reason(CONTROL_SHUTDOWN_REQUEST, reason)
    }

    /// Create a shutdown acknowledgement.
    pub fn shutdown_ack() -> Self {
        Self::bare(CONTROL_SHUTDOWN_ACK)
    }

    /// Create a rejection sent instead of a handshake response.
    pub fn reject(reason: &str) -> Self {
        Self::with_reason(CONTROL_REJECT, Some(reason))
    }

    /// The `reason` field of the payload, if any.
    pub fn reason(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("reason"))
            .and_then(|reason| reason.as_str())
    }

    /// Encode as a CONTROL stream frame.
    pub fn to_frame(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self)?;
        Ok(Frame::new(CONTROL_STREAM, FrameKind::Control, payload))
    }

    pub fn decode(payload: &Bytes) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
