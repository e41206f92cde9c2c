use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::BridgeStream;

/// Listen address used when none is configured: all interfaces, port 50051.
pub const DEFAULT_LISTEN_ADDR: &str = "[::]:50051";

/// TCP transport.
///
/// Provides bind/accept/connect over TCP sockets. TCP_NODELAY is enabled on
/// every stream: bridge frames are small and latency-sensitive (pose updates
/// at 10 Hz, image chunks at ~30 Hz).
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on a TCP address (e.g. `[::]:50051`, `127.0.0.1:0`).
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        info!(%local_addr, "listening on tcp");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> Result<BridgeStream> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        configure(&stream)?;
        debug!(%peer, "accepted connection");
        Ok(BridgeStream::from_tcp(stream))
    }

    /// Accept an incoming connection and return the raw TCP stream.
    ///
    /// Used by the TLS acceptor, which wraps the stream itself.
    pub async fn accept_tcp(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        configure(&stream)?;
        debug!(%peer, "accepted tcp connection");
        Ok((stream, peer))
    }

    /// Connect to a listening bridge.
    pub async fn connect(addr: &str) -> Result<BridgeStream> {
        let stream = connect_tcp(addr).await?;
        Ok(BridgeStream::from_tcp(stream))
    }

    /// The address this transport is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

pub(crate) async fn connect_tcp(addr: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    configure(&stream)?;
    debug!(addr, "connected over tcp");
    Ok(stream)
}

fn configure(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn bind_ephemeral_port() {
        let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(transport.local_addr().port(), 0);
        assert_eq!(transport.transport_name(), "tcp");
    }

    #[tokio::test]
    async fn connect_and_accept_roundtrip() {
        let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().to_string();

        let server = tokio::spawn(async move {
            let mut stream = transport.accept().await.unwrap();
            assert!(stream.peer_addr().is_some());
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = TcpTransport::connect(&addr).await.unwrap();
        assert_eq!(client.transport_name(), "tcp");
        assert!(!client.is_secure());
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused_reports_address() {
        let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().to_string();
        drop(transport);

        let err = TcpTransport::connect(&addr).await.unwrap_err();
        match err {
            TransportError::Connect { addr: reported, .. } => assert_eq!(reported, addr),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn bind_invalid_address_fails() {
        let err = TcpTransport::bind("not-an-address").await.err().unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
    }
}
