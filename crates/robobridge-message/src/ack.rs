use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Acknowledgement for exactly one received payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub success: bool,
    pub message: String,
}

impl AckFrame {
    /// Successful acknowledgement.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Why a stream session was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    ResourceExhausted,
    Unimplemented,
    Internal,
    Unavailable,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Cancelled => "cancelled",
            StatusCode::InvalidArgument => "invalid_argument",
            StatusCode::DeadlineExceeded => "deadline_exceeded",
            StatusCode::ResourceExhausted => "resource_exhausted",
            StatusCode::Unimplemented => "unimplemented",
            StatusCode::Internal => "internal",
            StatusCode::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of an aborted stream session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortStatus {
    pub code: StatusCode,
    pub message: String,
}

impl AbortStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Status for a payload the consumer failed to process.
    pub fn internal(error: impl fmt::Display) -> Self {
        Self::new(StatusCode::Internal, format!("Internal error: {error}"))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Display for AbortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_shape_is_success_and_message() {
        let ack = AckFrame::ok("Processed image data");
        let value: serde_json::Value = serde_json::from_slice(&ack.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"success": true, "message": "Processed image data"})
        );
        assert_eq!(AckFrame::decode(&ack.encode().unwrap()).unwrap(), ack);
    }

    #[test]
    fn internal_status_carries_error_text() {
        let status = AbortStatus::internal("disk full");
        assert_eq!(status.code, StatusCode::Internal);
        assert_eq!(status.message, "Internal error: disk full");
        assert_eq!(status.to_string(), "internal: Internal error: disk full");

        let wire = status.encode().unwrap();
        assert!(std::str::from_utf8(&wire).unwrap().contains("\"internal\""));
        assert_eq!(AbortStatus::decode(&wire).unwrap(), status);
    }

    #[test]
    fn malformed_ack_is_rejected() {
        assert!(AckFrame::decode(b"{\"success\":\"yes\"}").is_err());
    }
}
