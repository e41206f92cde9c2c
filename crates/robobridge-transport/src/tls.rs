//! TLS over TCP, backed by rustls with the ring crypto provider.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::tcp::{connect_tcp, TcpTransport};
use crate::traits::BridgeStream;

/// Server-side TLS material.
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    /// PEM certificate chain presented to clients.
    pub cert_path: PathBuf,
    /// PEM private key matching the leaf certificate.
    pub key_path: PathBuf,
}

/// Client-side TLS material.
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    /// PEM bundle of trusted root certificates.
    pub ca_path: PathBuf,
    /// Name the server certificate must be valid for.
    pub server_name: String,
}

/// Loaded server-side TLS state, shared by every accepted connection.
#[derive(Clone)]
pub struct TlsServer {
    acceptor: TlsAcceptor,
}

impl TlsServer {
    /// Complete the server side of a TLS handshake on an accepted TCP stream.
    pub async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<BridgeStream> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|err| TransportError::Tls(format!("handshake with {peer} failed: {err}")))?;
        debug!(%peer, "accepted tls connection");
        Ok(BridgeStream::from_tls_server(tls, Some(peer)))
    }
}

impl std::fmt::Debug for TlsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServer").finish_non_exhaustive()
    }
}

impl TlsServerConfig {
    /// Load the certificate chain and key.
    pub fn build(&self) -> Result<TlsServer> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_error)?;

        Ok(TlsServer {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }
}

impl TlsClientConfig {
    /// Load the trusted roots into a TLS connector.
    fn connector(&self) -> Result<TlsConnector> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(&self.ca_path)? {
            roots.add(cert).map_err(tls_error)?;
        }

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(TlsConnector::from(Arc::new(config)))
    }

    fn server_name(&self) -> Result<ServerName<'static>> {
        ServerName::try_from(self.server_name.clone()).map_err(|err| {
            TransportError::Tls(format!("invalid server name '{}': {err}", self.server_name))
        })
    }
}

impl TcpTransport {
    /// Accept an incoming connection and complete the server side of a TLS handshake.
    pub async fn accept_tls(&self, server: &TlsServer) -> Result<BridgeStream> {
        let (stream, peer) = self.accept_tcp().await?;
        server.accept(stream, peer).await
    }

    /// Connect to a listening bridge over TLS.
    pub async fn connect_tls(addr: &str, config: &TlsClientConfig) -> Result<BridgeStream> {
        let connector = config.connector()?;
        let server_name = config.server_name()?;
        let stream = connect_tcp(addr).await?;
        let peer = stream.peer_addr().ok();
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|err| TransportError::Tls(format!("handshake with {addr} failed: {err}")))?;
        debug!(addr, "connected over tls");
        Ok(BridgeStream::from_tls_client(tls, peer))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| TransportError::Tls(format!("invalid certificate in {}: {err}", path.display())))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| TransportError::Tls(format!("invalid private key in {}: {err}", path.display())))?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path.display())))
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|err| TransportError::Tls(format!("cannot open {}: {err}", path.display())))?;
    Ok(BufReader::new(file))
}

fn tls_error(err: rustls::Error) -> TransportError {
    TransportError::Tls(err.to_string())
}
