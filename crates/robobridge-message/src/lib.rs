//! Message model carried by robobridge streams.
//!
//! Three categories (sensor, pose, image) each have a fixed payload shape.
//! Payloads travel as JSON objects whose field names match the polling
//! variant of the bridge, so one schema serves both transports. The bridge
//! never interprets payload values; it only routes and acknowledges them.

pub mod ack;
pub mod category;
pub mod clock;
pub mod error;
pub mod payload;

pub use ack::{AbortStatus, AckFrame, StatusCode};
pub use category::Category;
pub use clock::{now_millis, TimestampClock};
pub use error::{MessageError, Result};
pub use payload::{ImageChunk, PayloadFrame, PoseUpdate, SensorReading};
