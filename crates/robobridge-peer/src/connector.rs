use robobridge_message::Category;
#[cfg(feature = "tls")]
use robobridge_transport::TlsClientConfig;
use robobridge_transport::{BridgeStream, TcpTransport};

use crate::connection::{Connection, StreamConfig};
use crate::error::{PeerError, Result};
use crate::handshake::HandshakeConfig;

/// Client-side connection settings.
#[derive(Debug, Clone, Default)]
pub struct ConnectConfig {
    pub handshake: HandshakeConfig,
    pub stream: StreamConfig,
    /// Connect over TLS instead of plain TCP.
    #[cfg(feature = "tls")]
    pub tls: Option<TlsClientConfig>,
}

/// Connect to a listening bridge as a client.
pub async fn connect(addr: &str, categories: &[Category]) -> Result<Connection> {
    connect_with_config(addr, categories, &ConnectConfig::default()).await
}

/// Connect with explicit configuration.
///
/// Establishing the transport is bounded by the handshake timeout, as is
/// the handshake itself.
pub async fn connect_with_config(
    addr: &str,
    categories: &[Category],
    config: &ConnectConfig,
) -> Result<Connection> {
    let limit = config.handshake.timeout;
    let stream = tokio::time::timeout(limit, open_transport(addr, config))
        .await
        .map_err(|_| PeerError::Timeout(limit))??;
    Connection::client(stream, categories, &config.handshake, config.stream.clone()).await
}

async fn open_transport(addr: &str, config: &ConnectConfig) -> Result<BridgeStream> {
    #[cfg(feature = "tls")]
    if let Some(tls) = &config.tls {
        return Ok(TcpTransport::connect_tls(addr, tls).await?);
    }
    #[cfg(not(feature = "tls"))]
    let _ = config;
    Ok(TcpTransport::connect(addr).await?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use robobridge_message::{ImageChunk, PayloadFrame};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::consumer::HandlerRegistry;
    use crate::listener::{BridgeListener, ListenerConfig};

    async fn listener(handshake: HandshakeConfig) -> (String, CancellationToken) {
        let listener = BridgeListener::bind(ListenerConfig {
            addr: "127.0.0.1:0".to_string(),
            handshake,
            ..ListenerConfig::default()
        })
        .await
        .expect("listener should bind");
        let addr = listener.local_addr().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.serve(HandlerRegistry::default(), shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn connect_negotiates_requested_categories() {
        let (addr, shutdown) = listener(HandshakeConfig::default()).await;

        let client = connect(&addr, &[Category::Pose, Category::Sensor])
            .await
            .expect("client should connect");
        assert_eq!(client.categories(), &[Category::Pose, Category::Sensor]);
        assert!(!client.supports(Category::Image));
        assert!(!client.is_secure());
        assert!(client.ping().await.is_ok());

        client.close("done").await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn runtime_payload_not_limited_by_handshake_cap() {
        let (addr, shutdown) = listener(HandshakeConfig {
            max_handshake_payload: 16 * 1024,
            ..HandshakeConfig::default()
        })
        .await;

        let config = ConnectConfig {
            handshake: HandshakeConfig {
                max_handshake_payload: 16 * 1024,
                ..HandshakeConfig::default()
            },
            ..ConnectConfig::default()
        };
        let client = connect_with_config(&addr, &[Category::Image], &config)
            .await
            .expect("client should connect");
        let mut stream = client.open_stream(Category::Image).await.unwrap();
        stream
            .send(&PayloadFrame::Image(ImageChunk {
                width: 128,
                height: 128,
                encoding: "raw".to_string(),
                data: Bytes::from(vec![0xAB; 64 * 1024]),
                timestamp: 1,
            }))
            .await
            .unwrap();

        let ack = stream.receive().await.unwrap().unwrap();
        assert_eq!(ack.message, "Processed image data");

        client.close("done").await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn nothing_listening_is_a_transport_error() {
        let placeholder = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = placeholder.local_addr().to_string();
        drop(placeholder);

        let config = ConnectConfig {
            handshake: HandshakeConfig {
                timeout: Duration::from_secs(2),
                ..HandshakeConfig::default()
            },
            ..ConnectConfig::default()
        };
        let result = connect_with_config(&addr, &Category::ALL, &config).await;
        assert!(matches!(result, Err(PeerError::Transport(_))));
    }
}
