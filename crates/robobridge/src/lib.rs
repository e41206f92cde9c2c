//! Bidirectional multi-stream bridge for robot data.
//!
//! robobridge relays sensor readings, pose updates and image frames from a
//! producing side to a consuming side over one connection, one independent
//! acknowledged stream per category.
//!
//! # Crate Structure
//!
//! - [`transport`] - TCP, TLS and in-process duplex streams
//! - [`frame`] - Length-prefixed framing with stream multiplexing
//! - [`message`] - Categories, payloads, acknowledgements and abort statuses
//! - [`peer`] - Connections, stream channels, producer loops, consumer
//!   handlers, sessions and the connection listener

/// Re-export transport types.
pub mod transport {
    pub use robobridge_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use robobridge_frame::*;
}

/// Re-export message types.
pub mod message {
    pub use robobridge_message::*;
}

/// Re-export peer types.
pub mod peer {
    pub use robobridge_peer::*;
}
