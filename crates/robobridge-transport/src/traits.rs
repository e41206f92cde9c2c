use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A connected bridge stream; implements `AsyncRead + AsyncWrite`.
///
/// This is the fundamental I/O type returned by transport operations.
/// Plain TCP, TLS over TCP and in-process duplex pipes all present the same
/// byte-stream interface to the framing layer.
pub struct BridgeStream {
    inner: BridgeStreamInner,
    peer_addr: Option<SocketAddr>,
}

enum BridgeStreamInner {
    Tcp(TcpStream),
    Duplex(DuplexStream),
    #[cfg(feature = "tls")]
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    #[cfg(feature = "tls")]
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl BridgeStream {
    /// Wrap a connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            inner: BridgeStreamInner::Tcp(stream),
            peer_addr,
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn from_tls_server(
        stream: tokio_rustls::server::TlsStream<TcpStream>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner: BridgeStreamInner::TlsServer(Box::new(stream)),
            peer_addr,
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn from_tls_client(
        stream: tokio_rustls::client::TlsStream<TcpStream>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner: BridgeStreamInner::TlsClient(Box::new(stream)),
            peer_addr,
        }
    }

    /// Create a connected pair of in-process streams.
    ///
    /// Each direction buffers at most `max_buf_size` bytes before writes
    /// suspend.
    pub fn pair(max_buf_size: usize) -> (Self, Self) {
        let (left, right) = tokio::io::duplex(max_buf_size);
        (
            Self {
                inner: BridgeStreamInner::Duplex(left),
                peer_addr: None,
            },
            Self {
                inner: BridgeStreamInner::Duplex(right),
                peer_addr: None,
            },
        )
    }

    /// Remote address, when the stream runs over a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether the stream is encrypted.
    pub fn is_secure(&self) -> bool {
        match &self.inner {
            BridgeStreamInner::Tcp(_) | BridgeStreamInner::Duplex(_) => false,
            #[cfg(feature = "tls")]
            BridgeStreamInner::TlsServer(_) | BridgeStreamInner::TlsClient(_) => true,
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            BridgeStreamInner::Tcp(_) => "tcp",
            BridgeStreamInner::Duplex(_) => "duplex",
            #[cfg(feature = "tls")]
            BridgeStreamInner::TlsServer(_) | BridgeStreamInner::TlsClient(_) => "tls",
        }
    }
}

impl AsyncRead for BridgeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            BridgeStreamInner::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            BridgeStreamInner::Duplex(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            BridgeStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            BridgeStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BridgeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            BridgeStreamInner::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            BridgeStreamInner::Duplex(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            BridgeStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            BridgeStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            BridgeStreamInner::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            BridgeStreamInner::Duplex(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            BridgeStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            #[cfg(feature = "tls")]
            BridgeStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            BridgeStreamInner::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            BridgeStreamInner::Duplex(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            BridgeStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            BridgeStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for BridgeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeStream")
            .field("type", &self.transport_name())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
