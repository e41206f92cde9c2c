use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

/// `tokio_util` codec for bridge frames.
///
/// Wrap any `AsyncRead + AsyncWrite` with
/// `tokio_util::codec::Framed::new(io, BridgeCodec::default())` to get a
/// `Stream<Item = Result<Frame>>` and a `Sink<Frame>`.
#[derive(Debug, Clone, Default)]
pub struct BridgeCodec {
    config: FrameConfig,
}

impl BridgeCodec {
    /// Create a codec with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self { config }
    }

    /// Update maximum payload size for subsequent frames.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current codec configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for BridgeCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src, self.config.max_payload_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for BridgeCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.config.max_payload_size,
            });
        }
        encode_frame(frame.stream, frame.kind, &frame.payload, dst)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use futures_util::{SinkExt, StreamExt};
    use robobridge_transport::BridgeStream;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{Framed, FramedRead};

    use super::*;
    use crate::codec::{FrameKind, HEADER_SIZE, MAGIC};

    #[tokio::test]
    async fn frames_cross_a_duplex_stream_in_order() {
        let (left, right) = BridgeStream::pair(1024);
        let mut writer = Framed::new(left, BridgeCodec::default());
        let mut reader = Framed::new(right, BridgeCodec::default());

        writer
            .send(Frame::new(1, FrameKind::Open, &b"{\"category\":\"sensor\"}"[..]))
            .await
            .unwrap();
        writer
            .send(Frame::new(1, FrameKind::Payload, &b"one"[..]))
            .await
            .unwrap();
        writer.send(Frame::empty(1, FrameKind::End)).await.unwrap();

        let kinds: Vec<FrameKind> = [
            reader.next().await.unwrap().unwrap(),
            reader.next().await.unwrap().unwrap(),
            reader.next().await.unwrap().unwrap(),
        ]
        .iter()
        .map(|frame| frame.kind)
        .collect();

        assert_eq!(kinds, vec![FrameKind::Open, FrameKind::Payload, FrameKind::End]);
    }

    #[tokio::test]
    async fn large_payload_survives_small_pipe() {
        let (left, right) = BridgeStream::pair(256);
        let payload = vec![0xAB; 64 * 1024];
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            let mut writer = Framed::new(left, BridgeCodec::default());
            writer
                .send(Frame::new(9, FrameKind::Payload, payload))
                .await
                .unwrap();
        });

        let mut reader = Framed::new(right, BridgeCodec::default());
        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.stream, 9);
        assert_eq!(frame.payload.as_ref(), expected.as_slice());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn clean_eof_ends_the_stream() {
        let (mut left, right) = BridgeStream::pair(64);
        left.shutdown().await.unwrap();

        let mut reader = FramedRead::new(right, BridgeCodec::default());
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_connection_closed() {
        let (mut left, right) = BridgeStream::pair(64);
        let mut partial = BytesMut::new();
        partial.put_slice(&MAGIC);
        partial.put_u32_le(16);
        partial.put_u16_le(2);
        partial.put_u8(FrameKind::Payload.as_u8());
        partial.put_slice(b"only-part");
        left.write_all(&partial).await.unwrap();
        left.shutdown().await.unwrap();

        let mut reader = FramedRead::new(right, BridgeCodec::default());
        let err = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn encoder_enforces_payload_limit() {
        let mut codec = BridgeCodec::with_config(FrameConfig {
            max_payload_size: 4,
        });
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Frame::new(1, FrameKind::Payload, &b"oversized"[..]), &mut dst)
            .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(dst.is_empty());
    }

    #[test]
    fn decoder_limit_can_be_raised_after_handshake() {
        let mut codec = BridgeCodec::with_config(FrameConfig {
            max_payload_size: 8,
        });
        let mut wire = BytesMut::new();
        encode_frame(1, FrameKind::Payload, &[7u8; 32], &mut wire).unwrap();

        let mut first = wire.clone();
        assert!(matches!(
            codec.decode(&mut first),
            Err(FrameError::PayloadTooLarge { .. })
        ));

        codec.set_max_payload_size(1024);
        assert_eq!(codec.config().max_payload_size, 1024);
        let frame = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 32);
        assert_eq!(frame.wire_size(), HEADER_SIZE + 32);
    }
}
