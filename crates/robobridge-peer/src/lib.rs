//! Bidirectional multi-stream bridge sessions.
//!
//! This is the layer applications use. A [`Connection`] multiplexes one
//! stream per category over a single transport; a [`BridgeSession`] runs a
//! producer loop (client) or consumer handler (server) per category on it;
//! a [`BridgeListener`] admits clients and gives each a server session.

pub mod connection;
pub mod connector;
pub mod consumer;
pub mod control;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod producer;
pub mod session;
pub mod source;
pub mod stream;

pub use connection::{Connection, Role, StreamConfig};
pub use connector::{connect, connect_with_config, ConnectConfig};
pub use consumer::{
    handle, BroadcastProcessor, FrameProcessor, HandlerOutcome, HandlerRegistry, HandlerReport,
    LoggingProcessor,
};
pub use control::{
    ControlMessage, CONTROL_PING, CONTROL_PONG, CONTROL_REJECT, CONTROL_SHUTDOWN_ACK,
    CONTROL_SHUTDOWN_REQUEST,
};
pub use error::{PeerError, ProcessingError, Result};
pub use handshake::{
    handshake_client, handshake_server, HandshakeConfig, HandshakeRequest, HandshakeResponse,
    HandshakeResult, DEFAULT_WINDOW, MAX_WINDOW,
};
pub use listener::{BridgeListener, ListenerConfig, ListenerSummary, OverflowPolicy};
pub use producer::{
    run_producer, CadenceConfig, ProducerConfig, ProducerOutcome, ProducerReport,
};
pub use session::{
    BridgeSession, SessionConfig, SessionState, SessionSummary, UnitReport, UnitResult,
};
pub use source::{ChannelSource, FrameSource, SampleSource};
pub use stream::{
    ClientStream, ServerStream, SessionInfo, StreamChannel, StreamEnd, StreamReceiver,
    StreamSender, StreamState, WireMessage,
};
