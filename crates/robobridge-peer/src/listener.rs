//! Connection listener: admits clients up to a bound and runs a server
//! session for each.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use robobridge_frame::{BridgeCodec, FrameConfig};
use robobridge_message::Category;
use robobridge_transport::{BridgeStream, TcpTransport, DEFAULT_LISTEN_ADDR};
#[cfg(feature = "tls")]
use robobridge_transport::{TlsServer, TlsServerConfig};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, StreamConfig};
use crate::consumer::HandlerRegistry;
use crate::control::ControlMessage;
use crate::error::{PeerError, Result};
use crate::handshake::HandshakeConfig;
use crate::session::{BridgeSession, SessionConfig};

/// How long a rejected client gets to send its handshake before the reject.
const REJECT_READ_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a rejected connection is held open for the client to hang up.
const REJECT_LINGER: Duration = Duration::from_secs(1);

/// What to do with a connection that arrives while every slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Send a `reject` control message and close.
    #[default]
    Reject,
    /// Stop accepting until a slot frees up.
    Queue,
}

impl OverflowPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            OverflowPolicy::Reject => "reject",
            OverflowPolicy::Queue => "queue",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub addr: String,
    /// Concurrent connections admitted at once.
    pub max_connections: usize,
    pub overflow: OverflowPolicy,
    /// Categories offered to clients during the handshake.
    pub categories: Vec<Category>,
    pub handshake: HandshakeConfig,
    pub stream: StreamConfig,
    pub session: SessionConfig,
    /// How long `serve` waits for live sessions after shutdown is requested.
    pub shutdown_timeout: Duration,
    /// Over-limit connections being told `reject` at once. Beyond this they
    /// are closed without a reason.
    pub max_pending_rejects: usize,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsServerConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_connections: 10,
            overflow: OverflowPolicy::Reject,
            categories: Category::ALL.to_vec(),
            handshake: HandshakeConfig::default(),
            stream: StreamConfig::default(),
            session: SessionConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
            max_pending_rejects: 32,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

/// Connection counts reported when [`BridgeListener::serve`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerSummary {
    pub accepted: u64,
    pub rejected: u64,
    /// Over-limit connections closed without a reject message.
    pub dropped: u64,
    pub completed: u64,
    pub failed_handshakes: u64,
    /// Sessions still running when the shutdown timeout elapsed.
    pub abandoned: u64,
}

impl ListenerSummary {
    fn record(&mut self, joined: std::result::Result<ConnectionOutcome, JoinError>) {
        match joined {
            Ok(ConnectionOutcome::Completed) => self.completed += 1,
            Ok(ConnectionOutcome::HandshakeFailed) => self.failed_handshakes += 1,
            Err(err) => {
                error!(error = %err, "connection task failed");
                self.completed += 1;
            }
        }
    }
}

enum ConnectionOutcome {
    Completed,
    HandshakeFailed,
}

/// Everything a connection task needs, shared across all of them.
struct ServeContext {
    categories: Vec<Category>,
    handshake: HandshakeConfig,
    stream: StreamConfig,
    session: SessionConfig,
    #[cfg(feature = "tls")]
    tls: Option<TlsServer>,
}

impl ServeContext {
    async fn establish(&self, tcp: TcpStream, peer: SocketAddr) -> Result<BridgeStream> {
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            let limit = self.handshake.timeout;
            return match tokio::time::timeout(limit, tls.accept(tcp, peer)).await {
                Ok(stream) => Ok(stream?),
                Err(_) => Err(PeerError::Timeout(limit)),
            };
        }
        debug!(%peer, "plain tcp connection");
        Ok(BridgeStream::from_tcp(tcp))
    }
}

/// Accepts bridge clients and serves each on its own server session.
pub struct BridgeListener {
    transport: TcpTransport,
    config: ListenerConfig,
    #[cfg(feature = "tls")]
    tls: Option<TlsServer>,
}

impl BridgeListener {
    /// Bind the listening socket and load TLS material if configured.
    pub async fn bind(config: ListenerConfig) -> Result<Self> {
        #[cfg(feature = "tls")]
        let tls = config
            .tls
            .as_ref()
            .map(TlsServerConfig::build)
            .transpose()?;
        let transport = TcpTransport::bind(&config.addr).await?;

        info!(
            addr = %transport.local_addr(),
            max_connections = config.max_connections,
            overflow = %config.overflow,
            categories = ?config.categories,
            "bridge listener ready"
        );

        Ok(Self {
            transport,
            config,
            #[cfg(feature = "tls")]
            tls,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn is_secure(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.tls.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    /// Accept connections until `shutdown` is cancelled, then stop every
    /// live session and wait for them up to the shutdown timeout.
    pub async fn serve(self, registry: HandlerRegistry, shutdown: CancellationToken) -> Result<ListenerSummary> {
        let Self {
            transport,
            config,
            #[cfg(feature = "tls")]
            tls,
        } = self;
        let max_connections = config.max_connections.max(1);
        let overflow = config.overflow;
        let shutdown_timeout = config.shutdown_timeout;
        let reject_slots = Arc::new(Semaphore::new(config.max_pending_rejects.max(1)));
        let context = Arc::new(ServeContext {
            categories: config.categories,
            handshake: config.handshake,
            stream: config.stream,
            session: config.session,
            #[cfg(feature = "tls")]
            tls,
        });

        let slots = Arc::new(Semaphore::new(max_connections));
        let mut tasks: JoinSet<ConnectionOutcome> = JoinSet::new();
        let mut rejects: JoinSet<()> = JoinSet::new();
        let mut summary = ListenerSummary::default();
        let mut next_id = 0u64;

        loop {
            let queued = match overflow {
                OverflowPolicy::Queue => {
                    let permit = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                            summary.record(joined);
                            continue;
                        }
                        Some(_) = rejects.join_next(), if !rejects.is_empty() => continue,
                        permit = Arc::clone(&slots).acquire_owned() => permit,
                    };
                    match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    }
                }
                OverflowPolicy::Reject => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    summary.record(joined);
                    continue;
                }
                Some(_) = rejects.join_next(), if !rejects.is_empty() => continue,
                accepted = transport.accept_tcp() => accepted,
            };
            let (tcp, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };

            let permit = match queued.map_or_else(|| Arc::clone(&slots).try_acquire_owned(), Ok) {
                Ok(permit) => permit,
                Err(_) => {
                    let Ok(reject_permit) = Arc::clone(&reject_slots).try_acquire_owned() else {
                        summary.dropped += 1;
                        warn!(%peer, max_connections, "connection limit reached and reject backlog full; dropping");
                        drop(tcp);
                        continue;
                    };
                    summary.rejected += 1;
                    warn!(%peer, max_connections, "connection limit reached; rejecting");
                    let context = Arc::clone(&context);
                    rejects.spawn(async move {
                        let _reject_permit = reject_permit;
                        let reason = format!("server at capacity ({max_connections} connections)");
                        match context.establish(tcp, peer).await {
                            Ok(stream) => reject(stream, &reason, &context.handshake).await,
                            Err(err) => debug!(%peer, error = %err, "rejected connection dropped before reject"),
                        }
                    });
                    continue;
                }
            };

            next_id += 1;
            summary.accepted += 1;
            let connection_id = format!("conn-{next_id}");
            debug!(%peer, connection_id, "connection admitted");
            tasks.spawn(serve_connection(
                Arc::clone(&context),
                tcp,
                peer,
                connection_id,
                registry.clone(),
                shutdown.clone(),
                permit,
            ));
        }

        drop(transport);
        rejects.abort_all();
        info!(live = tasks.len(), timeout = ?shutdown_timeout, "listener shutting down");

        let deadline = tokio::time::Instant::now() + shutdown_timeout;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => summary.record(joined),
                Ok(None) => break,
                Err(_) => {
                    summary.abandoned = u64::try_from(tasks.len()).unwrap_or(u64::MAX);
                    warn!(abandoned = summary.abandoned, "sessions still running at shutdown timeout");
                    tasks.detach_all();
                    break;
                }
            }
        }
        while rejects.join_next().await.is_some() {}

        info!(
            accepted = summary.accepted,
            rejected = summary.rejected,
            dropped = summary.dropped,
            completed = summary.completed,
            failed_handshakes = summary.failed_handshakes,
            abandoned = summary.abandoned,
            "listener stopped"
        );
        Ok(summary)
    }
}

impl fmt::Debug for BridgeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeListener")
            .field("local_addr", &self.local_addr())
            .field("max_connections", &self.config.max_connections)
            .field("overflow", &self.config.overflow)
            .field("secure", &self.is_secure())
            .finish()
    }
}

async fn serve_connection(
    context: Arc<ServeContext>,
    tcp: TcpStream,
    peer: SocketAddr,
    connection_id: String,
    registry: HandlerRegistry,
    shutdown: CancellationToken,
    _permit: OwnedSemaphorePermit,
) -> ConnectionOutcome {
    let connection = match open_connection(&context, tcp, peer, &connection_id).await {
        Ok(connection) => connection,
        Err(err) => {
            warn!(%peer, connection_id, error = %err, "handshake failed");
            return ConnectionOutcome::HandshakeFailed;
        }
    };

    let session = BridgeSession::new(connection, context.session.clone());
    if let Err(err) = session.start_handlers(registry).await {
        warn!(%peer, connection_id, error = %err, "session did not start");
    }

    tokio::select! {
        _ = session.wait_stopped() => {}
        _ = shutdown.cancelled() => {
            debug!(connection_id, "shutdown requested; stopping session");
        }
    }
    let summary = session.stop().await;
    info!(
        %peer,
        connection_id,
        units = summary.units.len(),
        failures = summary.units.iter().filter(|unit| unit.is_failure()).count(),
        forced = summary.forced,
        "connection finished"
    );
    ConnectionOutcome::Completed
}

async fn open_connection(
    context: &ServeContext,
    tcp: TcpStream,
    peer: SocketAddr,
    connection_id: &str,
) -> Result<Connection> {
    let stream = context.establish(tcp, peer).await?;
    Connection::server(
        stream,
        &context.categories,
        connection_id,
        &context.handshake,
        context.stream.clone(),
    )
    .await
}

/// Turn a client away with a reason it can surface.
///
/// The client's handshake is read first so the reply is not lost to a
/// connection reset, and the socket lingers until the client hangs up.
async fn reject(stream: BridgeStream, reason: &str, handshake: &HandshakeConfig) {
    let mut framed = Framed::new(
        stream,
        BridgeCodec::with_config(FrameConfig {
            max_payload_size: handshake.max_handshake_payload,
        }),
    );
    let _ = tokio::time::timeout(REJECT_READ_TIMEOUT, framed.next()).await;

    let sent = match ControlMessage::reject(reason).to_frame() {
        Ok(frame) => framed.send(frame).await.map_err(PeerError::from),
        Err(err) => Err(err),
    };
    if let Err(err) = sent {
        debug!(error = %err, "reject not delivered");
        return;
    }
    let _ = framed.close().await;
    let _ = tokio::time::timeout(REJECT_LINGER, async {
        while let Some(Ok(_)) = framed.next().await {}
    })
    .await;
}

#[cfg(test)]
mod tests {
    use robobridge_message::{AckFrame, PayloadFrame, SensorReading};

    use super::*;
    use crate::connector::connect;

    fn local(max_connections: usize, overflow: OverflowPolicy) -> ListenerConfig {
        ListenerConfig {
            addr: "127.0.0.1:0".to_string(),
            max_connections,
            overflow,
            shutdown_timeout: Duration::from_secs(3),
            ..ListenerConfig::default()
        }
    }

    async fn start(
        config: ListenerConfig,
    ) -> (String, CancellationToken, tokio::task::JoinHandle<Result<ListenerSummary>>) {
        let listener = BridgeListener::bind(config)
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().to_string();
        let shutdown = CancellationToken::new();
        let serve = tokio::spawn(listener.serve(HandlerRegistry::default(), shutdown.clone()));
        (addr, shutdown, serve)
    }

    #[tokio::test]
    async fn sensor_reading_round_trips_over_tcp() {
        let (addr, shutdown, serve) = start(local(4, OverflowPolicy::Reject)).await;

        let client = connect(&addr, &Category::ALL)
            .await
            .expect("client should connect");
        assert_eq!(client.id(), "conn-1");
        assert_eq!(client.transport(), "tcp");

        let mut stream = client.open_stream(Category::Sensor).await.unwrap();
        stream
            .send(&PayloadFrame::Sensor(SensorReading {
                sensor_id: "temp_sensor_1".to_string(),
                value: 25.5,
                unit: "celsius".to_string(),
                timestamp: 1_700_000_000_000,
            }))
            .await
            .unwrap();
        assert_eq!(
            stream.receive().await.unwrap(),
            Some(AckFrame::ok("Processed sensor data from temp_sensor_1"))
        );

        client.close("done").await;
        shutdown.cancel();
        let summary = serve.await.unwrap().unwrap();
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.abandoned, 0);
    }

    #[tokio::test]
    async fn eleventh_connection_is_rejected_at_capacity() {
        let (addr, shutdown, serve) = start(local(10, OverflowPolicy::Reject)).await;

        let mut clients = Vec::new();
        for _ in 0..10 {
            clients.push(connect(&addr, &Category::ALL).await.expect("client should connect"));
        }

        match connect(&addr, &Category::ALL).await {
            Err(PeerError::Rejected(reason)) => assert!(reason.contains("capacity"), "{reason}"),
            other => panic!("expected rejection, got {other:?}"),
        }

        shutdown.cancel();
        let summary = serve.await.unwrap().unwrap();
        assert_eq!(summary.accepted, 10);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.completed, 10);
        for client in &clients {
            tokio::time::timeout(Duration::from_secs(3), client.closed())
                .await
                .expect("server shutdown should close every client");
        }
    }

    #[tokio::test]
    async fn reject_backlog_is_bounded_and_cleared_at_shutdown() {
        use tokio::io::AsyncReadExt;

        let mut config = local(1, OverflowPolicy::Reject);
        config.max_pending_rejects = 2;
        let (addr, shutdown, serve) = start(config).await;
        let admitted = connect(&addr, &Category::ALL).await.unwrap();

        // Silent clients: a reject task waits for their handshake first.
        let mut silent = Vec::new();
        for _ in 0..5 {
            silent.push(TcpStream::connect(&addr).await.unwrap());
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        let mut closed_at_once = 0;
        let mut pending = Vec::new();
        for mut stream in silent {
            let mut buf = [0u8; 64];
            match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => closed_at_once += 1,
                Ok(Ok(n)) => panic!("unexpected {n} bytes before the reject delay"),
                Err(_) => pending.push(stream),
            }
        }
        assert_eq!(closed_at_once, 3);
        assert_eq!(pending.len(), 2);

        shutdown.cancel();
        let summary = serve.await.unwrap().unwrap();
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.dropped, 3);

        for mut stream in pending {
            let mut buf = [0u8; 64];
            let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("aborted reject task should release its socket");
            assert!(matches!(read, Ok(0) | Err(_)), "{read:?}");
        }
        drop(admitted);
    }

    #[tokio::test]
    async fn queue_policy_admits_once_a_slot_frees() {
        let (addr, shutdown, serve) = start(local(1, OverflowPolicy::Queue)).await;

        let first = connect(&addr, &Category::ALL).await.unwrap();
        let second_addr = addr.clone();
        let mut second = tokio::spawn(async move { connect(&second_addr, &Category::ALL).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(futures_util::FutureExt::now_or_never(&mut second).is_none());

        first.close("done").await;
        let second = tokio::time::timeout(Duration::from_secs(3), second)
            .await
            .expect("queued client should be admitted")
            .unwrap()
            .expect("queued client should handshake");
        assert_eq!(second.id(), "conn-2");

        shutdown.cancel();
        let summary = serve.await.unwrap().unwrap();
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.rejected, 0);
    }

    #[tokio::test]
    async fn handshake_failures_are_counted() {
        let mut config = local(2, OverflowPolicy::Reject);
        config.categories = vec![Category::Image];
        let (addr, shutdown, serve) = start(config).await;

        let result = connect(&addr, &[Category::Sensor]).await;
        assert!(result.is_err());

        shutdown.cancel();
        let summary = serve.await.unwrap().unwrap();
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.failed_handshakes, 1);
    }

    #[test]
    fn defaults_match_documented_limits() {
        let config = ListenerConfig::default();
        assert_eq!(config.addr, "[::]:50051");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_pending_rejects, 32);
        assert_eq!(config.overflow, OverflowPolicy::Reject);
        assert_eq!(config.categories, Category::ALL.to_vec());
        assert_eq!(OverflowPolicy::Queue.to_string(), "queue");
    }
}
