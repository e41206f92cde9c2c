use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::stream::StreamId;

/// Frame header: magic (2) + length (4) + stream (2) + kind (1) = 9 bytes.
pub const HEADER_SIZE: usize = 9;

/// Magic bytes: "RB" (0x52 0x42).
pub const MAGIC: [u8; 2] = [0x52, 0x42];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// What a frame means to the stream it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Connection-level control message (stream 0 only).
    Control = 0,
    /// Opens a new category stream.
    Open = 1,
    /// One payload frame on an open stream.
    Payload = 2,
    /// One acknowledgement for a received payload.
    Ack = 3,
    /// End of stream; the sender will write nothing more.
    End = 4,
    /// The stream was aborted; carries a status.
    Abort = 5,
}

impl FrameKind {
    /// Wire value of this kind.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Short lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Control => "control",
            FrameKind::Open => "open",
            FrameKind::Payload => "payload",
            FrameKind::Ack => "ack",
            FrameKind::End => "end",
            FrameKind::Abort => "abort",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Control),
            1 => Ok(FrameKind::Open),
            2 => Ok(FrameKind::Payload),
            3 => Ok(FrameKind::Ack),
            4 => Ok(FrameKind::End),
            5 => Ok(FrameKind::Abort),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// A framed message with stream routing.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The stream this message belongs to.
    pub stream: StreamId,
    /// What the frame means to that stream.
    pub kind: FrameKind,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(stream: StreamId, kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            stream,
            kind,
            payload: payload.into(),
        }
    }

    /// Create a frame with no payload (e.g. `End`).
    pub fn empty(stream: StreamId, kind: FrameKind) -> Self {
        Self::new(stream, kind, Bytes::new())
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬──────────┬─────────┬─────────────────┐
/// │ Magic (2B)   │ Length    │ Stream   │ Kind    │ Payload         │
/// │ 0x52 0x42    │ (4B LE)   │ (2B LE)  │ (1B)    │ (Length bytes)  │
/// │ "RB"         │           │          │         │                 │
/// └──────────────┴───────────┴──────────┴─────────┴─────────────────┘
/// ```
pub fn encode_frame(
    stream: StreamId,
    kind: FrameKind,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u16_le(stream);
    dst.put_u8(kind.as_u8());
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let stream = u16::from_le_bytes([src[6], src[7]]);
    let kind = FrameKind::try_from(src[8])?;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        stream,
        kind,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_payload_frame() {
        let mut buf = BytesMut::new();
        let payload = br#"{"sensor_id":"temp_sensor_1"}"#;

        encode_frame(3, FrameKind::Payload, payload, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + payload.len());

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();

        assert_eq!(frame.stream, 3);
        assert_eq!(frame.kind, FrameKind::Payload);
        assert_eq!(frame.payload.as_ref(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x52, 0x42, 0x00][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(1, FrameKind::Ack, b"hello", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn test_decode_invalid_magic() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::InvalidMagic)));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(0);
        buf.put_u16_le(1);
        buf.put_u8(0x7F);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::UnknownKind(0x7F))));
    }

    #[test]
    fn test_decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(1024 * 1024 * 32);
        buf.put_u16_le(1);
        buf.put_u8(FrameKind::Payload.as_u8());

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_interleaved_streams_keep_order() {
        let mut buf = BytesMut::new();
        encode_frame(1, FrameKind::Payload, b"sensor-0", &mut buf).unwrap();
        encode_frame(2, FrameKind::Payload, b"pose-0", &mut buf).unwrap();
        encode_frame(1, FrameKind::Payload, b"sensor-1", &mut buf).unwrap();

        let frames: Vec<Frame> = std::iter::from_fn(|| {
            decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap()
        })
        .collect();

        let seen: Vec<(u16, &[u8])> = frames
            .iter()
            .map(|f| (f.stream, f.payload.as_ref()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (1, b"sensor-0".as_ref()),
                (2, b"pose-0".as_ref()),
                (1, b"sensor-1".as_ref()),
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_end_frame() {
        let mut buf = BytesMut::new();
        let end = Frame::empty(4, FrameKind::End);
        encode_frame(end.stream, end.kind, &end.payload, &mut buf).unwrap();

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(frame.stream, 4);
        assert_eq!(frame.kind, FrameKind::End);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_frame_wire_size() {
        let frame = Frame::new(1, FrameKind::Payload, Bytes::from_static(b"test"));
        assert_eq!(frame.wire_size(), HEADER_SIZE + 4);
    }

    #[test]
    fn test_kind_names() {
        for value in 0..=5u8 {
            let kind = FrameKind::try_from(value).unwrap();
            assert_eq!(kind.as_u8(), value);
            assert!(!kind.as_str().is_empty());
        }
    }
}
