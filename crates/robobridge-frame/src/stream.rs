//! Stream IDs.
//!
//! Stream 0 carries connection control traffic (handshake, ping/pong,
//! shutdown, reject). Every other ID names one category stream session.

/// Numeric stream identifier carried in every frame header.
pub type StreamId = u16;

/// Connection management (handshake, ping/pong, shutdown, reject).
pub const CONTROL_STREAM: StreamId = 0;

/// First ID handed out to a category stream.
pub const FIRST_DATA_STREAM: StreamId = 1;

/// Returns true if the stream ID is the control stream.
pub fn is_control(id: StreamId) -> bool {
    id == CONTROL_STREAM
}

/// Returns a human-readable name for a stream ID.
pub fn stream_name(id: StreamId) -> &'static str {
    if is_control(id) {
        "CONTROL"
    } else {
        "DATA"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_stream_is_zero() {
        assert!(is_control(CONTROL_STREAM));
        assert!(!is_control(FIRST_DATA_STREAM));
        assert_eq!(stream_name(0), "CONTROL");
        assert_eq!(stream_name(7), "DATA");
    }
}
