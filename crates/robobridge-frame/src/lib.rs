//! Length-prefixed message framing with stream multiplexing.
//!
//! Every message on a bridge connection is framed with:
//! - A 2-byte magic number ("RB") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian stream ID for multiplexing
//! - A 1-byte frame kind (open, payload, ack, end, abort, control)
//!
//! Stream 0 is reserved for connection control; category streams are
//! allocated from 1 upwards by the side that opens them.

pub mod codec;
pub mod error;
pub mod framed;
pub mod stream;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, FrameKind, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use framed::BridgeCodec;
pub use stream::{is_control, stream_name, StreamId, CONTROL_STREAM, FIRST_DATA_STREAM};
