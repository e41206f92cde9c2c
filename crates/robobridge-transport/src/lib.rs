//! Stream transport abstraction for robobridge.
//!
//! Provides a unified connected-stream type over the transports a bridge
//! connection can run on:
//! - plain TCP (the default, "insecure" transport)
//! - TLS over TCP (behind the `tls` feature)
//! - in-process duplex pipes (for tests and embedding)
//!
//! This is the lowest layer of robobridge. Everything else builds on top of
//! the [`BridgeStream`] type provided here.

pub mod error;
pub mod tcp;
pub mod traits;

#[cfg(feature = "tls")]
pub mod tls;

pub use error::{Result, TransportError};
pub use tcp::{TcpTransport, DEFAULT_LISTEN_ADDR};
pub use traits::BridgeStream;

#[cfg(feature = "tls")]
pub use tls::{TlsClientConfig, TlsServer, TlsServerConfig};
