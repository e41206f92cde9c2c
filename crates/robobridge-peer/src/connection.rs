use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use robobridge_frame::{
    is_control, BridgeCodec, Frame, FrameConfig, FrameKind, StreamId, DEFAULT_MAX_PAYLOAD,
    FIRST_DATA_STREAM,
};
use robobridge_message::{AbortStatus, Category, StatusCode};
use robobridge_transport::BridgeStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{
    ControlMessage, CONTROL_PING, CONTROL_PONG, CONTROL_REJECT, CONTROL_SHUTDOWN_ACK,
    CONTROL_SHUTDOWN_REQUEST,
};
use crate::error::{PeerError, Result};
use crate::handshake::{handshake_client, handshake_server, HandshakeConfig, HandshakeResult};
use crate::stream::{lock, ClientStream, ServerStream, SessionInfo, StreamEnd, StreamShared};

type FramedIo = Framed<BridgeStream, BridgeCodec>;

/// Runtime limits for an established connection and its streams.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Frames queued for the writer task before senders wait.
    pub write_queue: usize,
    /// Peer-opened streams waiting to be accepted before new ones are refused.
    pub accept_backlog: usize,
    /// Give up on a send blocked by backpressure after this long.
    pub send_timeout: Option<Duration>,
    /// Give up on a receive that sees no frame for this long.
    pub receive_timeout: Option<Duration>,
    /// How long [`Connection::ping`] waits for the pong.
    pub ping_timeout: Duration,
    /// Budget for flushing and shutting down in [`Connection::close`].
    pub close_timeout: Duration,
    /// Largest frame payload accepted after the handshake.
    pub max_payload_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            write_queue: 256,
            accept_backlog: 16,
            send_timeout: None,
            receive_timeout: None,
            ping_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Which side of the handshake this connection played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Dialed out; opens streams and produces payloads.
    Client,
    /// Accepted; receives streams and acknowledges payloads.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenStream {
    category: Category,
}

pub(crate) enum Outgoing {
    Frame(Frame),
    Close,
}

struct StreamEntry {
    shared: Arc<StreamShared>,
    inbound: mpsc::Sender<Bytes>,
}

enum ReadExit {
    Cancelled,
    PeerShutdown(String),
    Lost(String),
}

/// Connection state shared by the handle, its streams and its I/O tasks.
pub(crate) struct ConnectionShared {
    pub(crate) id: Arc<str>,
    role: Role,
    categories: Vec<Category>,
    window: usize,
    pub(crate) config: StreamConfig,
    streams: Mutex<HashMap<StreamId, StreamEntry>>,
    outbound: mpsc::Sender<Outgoing>,
    pending_pong: Mutex<Option<oneshot::Sender<()>>>,
    closing: AtomicBool,
    closed: CancellationToken,
    close_reason: Mutex<Option<String>>,
}

impl ConnectionShared {
    fn register(&self, shared: Arc<StreamShared>, inbound: mpsc::Sender<Bytes>) -> bool {
        let mut streams = lock(&self.streams);
        if streams.contains_key(&shared.id) {
            return false;
        }
        streams.insert(shared.id, StreamEntry { shared, inbound });
        true
    }

    fn detach(&self, id: StreamId) -> Option<StreamEntry> {
        lock(&self.streams).remove(&id)
    }

    fn lookup(&self, id: StreamId) -> Option<(mpsc::Sender<Bytes>, Arc<StreamShared>)> {
        lock(&self.streams)
            .get(&id)
            .map(|entry| (entry.inbound.clone(), Arc::clone(&entry.shared)))
    }

    fn disconnected(&self) -> PeerError {
        PeerError::Disconnected(
            lock(&self.close_reason)
                .clone()
                .unwrap_or_else(|| "connection writer stopped".to_string()),
        )
    }

    /// Queue a frame for the writer task, waiting for queue space.
    pub(crate) async fn enqueue(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(Outgoing::Frame(frame))
            .await
            .map_err(|_| self.disconnected())
    }

    /// Queue a frame without waiting. Used where blocking could deadlock
    /// (the reader task) or is impossible (`Drop`).
    pub(crate) fn try_enqueue(&self, frame: Frame) -> bool {
        let stream_id = frame.stream;
        let kind = frame.kind.as_str();
        match self.outbound.try_send(Outgoing::Frame(frame)) {
            Ok(()) => true,
            Err(err) => {
                let reason = match err {
                    TrySendError::Full(_) => "write queue full",
                    TrySendError::Closed(_) => "writer stopped",
                };
                debug!(connection_id = %self.id, stream_id, kind, reason, "frame not queued");
                false
            }
        }
    }

    pub(crate) async fn close_stream(&self, shared: &StreamShared) {
        if !shared.begin_closing() {
            return;
        }
        self.detach(shared.id);
        if let Err(err) = self.enqueue(Frame::empty(shared.id, FrameKind::End)).await {
            debug!(connection_id = %self.id, stream_id = shared.id, error = %err, "end-of-stream not delivered");
        }
        shared.finish(StreamEnd::Closed);
    }

    pub(crate) fn close_stream_now(&self, shared: &StreamShared) {
        if !shared.begin_closing() {
            return;
        }
        self.detach(shared.id);
        self.try_enqueue(Frame::empty(shared.id, FrameKind::End));
        shared.finish(StreamEnd::Closed);
    }

    pub(crate) async fn abort_stream(&self, shared: &StreamShared, status: AbortStatus) -> Result<()> {
        let payload = status.encode()?;
        if !shared.begin_closing() {
            return Ok(());
        }
        self.detach(shared.id);
        let sent = self
            .enqueue(Frame::new(shared.id, FrameKind::Abort, payload))
            .await;
        shared.finish(StreamEnd::Aborted(status));
        sent
    }

    pub(crate) fn abort_stream_now(&self, shared: &StreamShared, status: AbortStatus) {
        if !shared.begin_closing() {
            return;
        }
        self.detach(shared.id);
        self.send_abort(shared.id, &status);
        shared.finish(StreamEnd::Aborted(status));
    }

    fn send_abort(&self, id: StreamId, status: &AbortStatus) {
        match status.encode() {
            Ok(payload) => {
                self.try_enqueue(Frame::new(id, FrameKind::Abort, payload));
            }
            Err(err) => warn!(connection_id = %self.id, stream_id = id, error = %err, "abort status not encodable"),
        }
    }

    /// Refuse a stream that never made it into the registry.
    fn refuse(&self, id: StreamId, code: StatusCode, message: String) {
        warn!(connection_id = %self.id, stream_id = id, code = %code, reason = %message, "refusing stream");
        self.send_abort(id, &AbortStatus::new(code, message));
    }

    /// Abort a registered stream on the local receiver's and the peer's behalf.
    fn fail_stream(&self, shared: &StreamShared, status: AbortStatus) {
        warn!(
            connection_id = %self.id,
            stream_id = shared.id,
            category = %shared.category,
            status = %status,
            "aborting stream"
        );
        let entry = self.detach(shared.id);
        shared.finish(StreamEnd::Aborted(status.clone()));
        drop(entry);
        self.send_abort(shared.id, &status);
    }

    /// End every stream and mark the connection closed. Idempotent.
    fn terminate(&self, reason: &str, end: StreamEnd) {
        {
            let mut slot = lock(&self.close_reason);
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        let entries: Vec<StreamEntry> = lock(&self.streams).drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            entry.shared.finish(end.clone());
        }
        lock(&self.pending_pong).take();
        self.closed.cancel();
    }

    fn snapshot(&self) -> Vec<Arc<StreamShared>> {
        let mut streams: Vec<Arc<StreamShared>> = lock(&self.streams)
            .values()
            .map(|entry| Arc::clone(&entry.shared))
            .collect();
        streams.sort_by_key(|shared| shared.id);
        streams
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, incoming: &mpsc::Sender<ServerStream>) -> Option<ReadExit> {
        if is_control(frame.stream) != (frame.kind == FrameKind::Control) {
            return Some(ReadExit::Lost(format!(
                "protocol violation: {} frame on stream {}",
                frame.kind.as_str(),
                frame.stream
            )));
        }
        match frame.kind {
            FrameKind::Control => return self.on_control(&frame.payload),
            FrameKind::Open => self.on_open(frame, incoming),
            FrameKind::Payload | FrameKind::Ack => self.on_data(frame),
            FrameKind::End => {
                if let Some(entry) = self.detach(frame.stream) {
                    entry.shared.finish(StreamEnd::EndedByPeer);
                    debug!(connection_id = %self.id, stream_id = frame.stream, "stream ended by peer");
                }
            }
            FrameKind::Abort => {
                let status = AbortStatus::decode(&frame.payload).unwrap_or_else(|_| {
                    AbortStatus::new(
                        StatusCode::Internal,
                        String::from_utf8_lossy(&frame.payload).into_owned(),
                    )
                });
                if let Some(entry) = self.detach(frame.stream) {
                    warn!(
                        connection_id = %self.id,
                        stream_id = frame.stream,
                        category = %entry.shared.category,
                        status = %status,
                        "stream aborted by peer"
                    );
                    entry.shared.finish(StreamEnd::Aborted(status));
                }
            }
        }
        None
    }

    fn on_control(&self, payload: &Bytes) -> Option<ReadExit> {
        let msg = match ControlMessage::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(connection_id = %self.id, error = %err, "malformed control message ignored");
                return None;
            }
        };
        match msg.msg_type.as_str() {
            CONTROL_PING => {
                if let Ok(frame) = ControlMessage::pong().to_frame() {
                    self.try_enqueue(frame);
                }
            }
            CONTROL_PONG => {
                if let Some(waiter) = lock(&self.pending_pong).take() {
                    let _ = waiter.send(());
                }
            }
            CONTROL_SHUTDOWN_REQUEST => {
                if let Ok(frame) = ControlMessage::shutdown_ack().to_frame() {
                    self.try_enqueue(frame);
                }
                let reason = msg.reason().unwrap_or("peer requested shutdown");
                return Some(ReadExit::PeerShutdown(reason.to_string()));
            }
            CONTROL_SHUTDOWN_ACK => {
                debug!(connection_id = %self.id, "peer acknowledged shutdown");
            }
            CONTROL_REJECT => {
                let reason = msg.reason().unwrap_or("no reason given");
                return Some(ReadExit::Lost(format!("rejected by peer: {reason}")));
            }
            other => {
                debug!(connection_id = %self.id, msg_type = other, "unknown control message ignored");
            }
        }
        None
    }

    fn on_open(self: &Arc<Self>, frame: Frame, incoming: &mpsc::Sender<ServerStream>) {
        let id = frame.stream;
        if self.role != Role::Server {
            self.refuse(id, StatusCode::InvalidArgument, "clients do not accept streams".to_string());
            return;
        }
        let category = match serde_json::from_slice::<OpenStream>(&frame.payload) {
            Ok(open) => open.category,
            Err(err) => {
                self.refuse(id, StatusCode::InvalidArgument, format!("malformed open request: {err}"));
                return;
            }
        };
        if !self.categories.contains(&category) {
            self.refuse(
                id,
                StatusCode::Unimplemented,
                format!("category {category} not negotiated on this connection"),
            );
            return;
        }

        let (tx, rx) = mpsc::channel(self.window);
        let shared = StreamShared::new(id, category, Arc::clone(&self.id), self.window, false);
        if !self.register(Arc::clone(&shared), tx) {
            self.refuse(id, StatusCode::InvalidArgument, format!("stream {id} is already open"));
            return;
        }
        let stream = ServerStream::new(shared, Arc::clone(self), rx);

        match incoming.try_send(stream) {
            Ok(()) => {
                debug!(connection_id = %self.id, stream_id = id, category = %category, "stream opened by peer");
            }
            Err(TrySendError::Full(stream)) => stream.abort_now(AbortStatus::new(
                StatusCode::ResourceExhausted,
                "too many streams waiting to be accepted",
            )),
            Err(TrySendError::Closed(stream)) => stream.abort_now(AbortStatus::new(
                StatusCode::Unavailable,
                "connection is not accepting streams",
            )),
        }
    }

    fn on_data(&self, frame: Frame) {
        let expected = match self.role {
            Role::Server => FrameKind::Payload,
            Role::Client => FrameKind::Ack,
        };
        let Some((inbound, shared)) = self.lookup(frame.stream) else {
            debug!(
                connection_id = %self.id,
                stream_id = frame.stream,
                kind = frame.kind.as_str(),
                "frame for closed stream discarded"
            );
            return;
        };
        if frame.kind != expected {
            self.fail_stream(
                &shared,
                AbortStatus::new(
                    StatusCode::InvalidArgument,
                    format!("unexpected {} frame", frame.kind.as_str()),
                ),
            );
            return;
        }
        match inbound.try_send(frame.payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.fail_stream(
                &shared,
                AbortStatus::new(
                    StatusCode::ResourceExhausted,
                    format!("more than {} unacknowledged payloads", self.window),
                ),
            ),
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %self.id, stream_id = frame.stream, "receiver gone; frame discarded");
            }
        }
    }
}

/// An established, handshaken bridge connection.
///
/// One reader task and one writer task serve every stream session on the
/// connection. Dropping the connection resets any stream still open.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    handshake: HandshakeResult,
    incoming: tokio::sync::Mutex<mpsc::Receiver<ServerStream>>,
    next_stream_id: AtomicU32,
    writer: Mutex<Option<JoinHandle<()>>>,
    peer_addr: Option<SocketAddr>,
    transport: &'static str,
    secure: bool,
}

impl Connection {
    /// Handshake as the client and start serving the connection.
    pub async fn client(
        stream: BridgeStream,
        categories: &[Category],
        handshake: &HandshakeConfig,
        config: StreamConfig,
    ) -> Result<Self> {
        let mut framed = handshake_framed(stream, handshake);
        let result = handshake_client(&mut framed, categories, handshake).await?;
        Ok(Self::establish(framed, result, Role::Client, config))
    }

    /// Handshake as the server and start serving the connection.
    pub async fn server(
        stream: BridgeStream,
        supported: &[Category],
        connection_id: &str,
        handshake: &HandshakeConfig,
        config: StreamConfig,
    ) -> Result<Self> {
        let mut framed = handshake_framed(stream, handshake);
        let result = handshake_server(&mut framed, supported, connection_id, handshake).await?;
        Ok(Self::establish(framed, result, Role::Server, config))
    }

    fn establish(
        mut framed: FramedIo,
        handshake: HandshakeResult,
        role: Role,
        config: StreamConfig,
    ) -> Self {
        let peer_addr = framed.get_ref().peer_addr();
        let transport = framed.get_ref().transport_name();
        let secure = framed.get_ref().is_secure();
        framed.codec_mut().set_max_payload_size(config.max_payload_size);

        let window = usize::try_from(handshake.window).unwrap_or(usize::MAX).max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.write_queue.max(1));
        let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(ConnectionShared {
            id: Arc::from(handshake.connection_id.as_str()),
            role,
            categories: handshake.negotiated_categories.clone(),
            window,
            config,
            streams: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            pending_pong: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
        });

        let (sink, frames) = framed.split();
        let writer = tokio::spawn(write_loop(Arc::clone(&shared), sink, outbound_rx));
        tokio::spawn(read_loop(Arc::clone(&shared), frames, incoming_tx));

        info!(
            connection_id = %shared.id,
            role = %role,
            peer = ?peer_addr,
            transport,
            categories = ?shared.categories,
            window,
            "connection established"
        );

        Self {
            shared,
            handshake,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            next_stream_id: AtomicU32::new(u32::from(FIRST_DATA_STREAM)),
            writer: Mutex::new(Some(writer)),
            peer_addr,
            transport,
            secure,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Categories both sides agreed to stream.
    pub fn categories(&self) -> &[Category] {
        &self.shared.categories
    }

    pub fn supports(&self, category: Category) -> bool {
        self.shared.categories.contains(&category)
    }

    /// Negotiated per-stream window.
    pub fn window(&self) -> usize {
        self.shared.window
    }

    pub fn handshake(&self) -> &HandshakeResult {
        &self.handshake
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn transport(&self) -> &'static str {
        self.transport
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection is closed or lost.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Token cancelled when the connection closes, for watchers that must
    /// not keep the connection alive.
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    pub fn close_reason(&self) -> Option<String> {
        lock(&self.shared.close_reason).clone()
    }

    /// Snapshot of every stream session still registered, by stream id.
    pub fn streams(&self) -> Vec<SessionInfo> {
        self.shared
            .snapshot()
            .iter()
            .map(|shared| shared.info())
            .collect()
    }

    /// Open a stream session for `category`. Client side only.
    pub async fn open_stream(&self, category: Category) -> Result<ClientStream> {
        if self.shared.role != Role::Client {
            return Err(PeerError::InvalidState(
                "only the client side opens streams".to_string(),
            ));
        }
        if self.is_closed() {
            return Err(self.shared.disconnected());
        }
        if !self.supports(category) {
            return Err(PeerError::UnsupportedCategory(category));
        }

        let id = self.allocate_stream_id()?;
        let payload = serde_json::to_vec(&OpenStream { category })?;
        let (tx, rx) = mpsc::channel(self.shared.window);
        let shared = StreamShared::new(id, category, Arc::clone(&self.shared.id), self.shared.window, true);
        if !self.shared.register(Arc::clone(&shared), tx) {
            return Err(PeerError::ProtocolViolation(format!(
                "stream {id} allocated twice"
            )));
        }
        let stream = ClientStream::new(shared, Arc::clone(&self.shared), rx);
        self.shared
            .enqueue(Frame::new(id, FrameKind::Open, payload))
            .await?;

        debug!(connection_id = %self.shared.id, stream_id = id, category = %category, "stream opened");
        Ok(stream)
    }

    fn allocate_stream_id(&self) -> Result<StreamId> {
        let next = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        StreamId::try_from(next).map_err(|_| PeerError::StreamIdsExhausted)
    }

    /// Next stream opened by the peer. Server side only; `None` once the
    /// connection is gone.
    pub async fn accept_stream(&self) -> Option<ServerStream> {
        self.incoming.lock().await.recv().await
    }

    /// Round-trip a ping on the control stream.
    pub async fn ping(&self) -> Result<Duration> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.pending_pong) = Some(tx);
        let started = Instant::now();
        self.shared.enqueue(ControlMessage::ping().to_frame()?).await?;

        let timeout = self.shared.config.ping_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(self.shared.disconnected()),
            Err(_) => Err(PeerError::Timeout(timeout)),
        }
    }

    /// Signal end-of-stream on every open stream session.
    pub async fn close_streams(&self) {
        for shared in self.shared.snapshot() {
            self.shared.close_stream(&shared).await;
        }
    }

    /// Force-close: every stream is reset and the I/O tasks stop without
    /// waiting for queued frames.
    pub fn reset(&self, reason: &str) {
        if !self.is_closed() {
            warn!(connection_id = %self.shared.id, reason, "resetting connection");
        }
        self.shared
            .terminate(reason, StreamEnd::Reset(reason.to_string()));
    }

    /// Graceful close: end every stream, tell the peer, flush, shut down.
    ///
    /// Bounded by [`StreamConfig::close_timeout`]; whatever is still queued
    /// when it elapses is dropped.
    pub async fn close(&self, reason: &str) {
        if self.is_closed() || self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let writer = lock(&self.writer).take();
        let graceful = async {
            self.close_streams().await;
            if let Ok(frame) = ControlMessage::shutdown_request(Some(reason)).to_frame() {
                let _ = self.shared.enqueue(frame).await;
            }
            let _ = self.shared.outbound.send(Outgoing::Close).await;
            if let Some(writer) = writer {
                let _ = writer.await;
            }
        };
        if tokio::time::timeout(self.shared.config.close_timeout, graceful)
            .await
            .is_err()
        {
            warn!(
                connection_id = %self.shared.id,
                timeout = ?self.shared.config.close_timeout,
                "connection did not flush before close timeout"
            );
        }

        self.shared
            .terminate(reason, StreamEnd::Reset(reason.to_string()));
        info!(connection_id = %self.shared.id, reason, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.terminate(
            "connection dropped",
            StreamEnd::Reset("connection dropped".to_string()),
        );
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("categories", &self.shared.categories)
            .field("window", &self.shared.window)
            .field("peer_addr", &self.peer_addr)
            .field("transport", &self.transport)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn handshake_framed(stream: BridgeStream, handshake: &HandshakeConfig) -> FramedIo {
    Framed::new(
        stream,
        BridgeCodec::with_config(FrameConfig {
            max_payload_size: handshake.max_handshake_payload,
        }),
    )
}

async fn write_loop(
    conn: Arc<ConnectionShared>,
    mut sink: SplitSink<FramedIo, Frame>,
    mut outbound: mpsc::Receiver<Outgoing>,
) {
    loop {
        let next = tokio::select! {
            biased;
            next = outbound.recv() => next,
            _ = conn.closed.cancelled() => None,
        };
        let frame = match next {
            Some(Outgoing::Frame(frame)) => frame,
            Some(Outgoing::Close) | None => break,
        };
        let written = tokio::select! {
            biased;
            written = sink.send(frame) => written,
            _ = conn.closed.cancelled() => return,
        };
        if let Err(err) = written {
            warn!(connection_id = %conn.id, error = %err, "connection write failed");
            let reason = format!("write failed: {err}");
            conn.terminate(&reason, StreamEnd::Reset(reason.clone()));
            return;
        }
    }
    if let Err(err) = sink.close().await {
        debug!(connection_id = %conn.id, error = %err, "connection shutdown was not clean");
    }
}

async fn read_loop(
    conn: Arc<ConnectionShared>,
    mut frames: SplitStream<FramedIo>,
    incoming: mpsc::Sender<ServerStream>,
) {
    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = conn.closed.cancelled() => break ReadExit::Cancelled,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                if let Some(exit) = conn.dispatch(frame, &incoming) {
                    break exit;
                }
            }
            Some(Err(err)) => break ReadExit::Lost(format!("read failed: {err}")),
            None => break ReadExit::Lost("connection closed by peer".to_string()),
        }
    };

    match exit {
        ReadExit::Cancelled => {}
        ReadExit::PeerShutdown(reason) => {
            info!(connection_id = %conn.id, reason = %reason, "peer closed connection");
            conn.terminate(&reason, StreamEnd::EndedByPeer);
        }
        ReadExit::Lost(reason) => {
            if conn.closing.load(Ordering::Acquire) {
                debug!(connection_id = %conn.id, reason = %reason, "connection finished closing");
            } else {
                warn!(connection_id = %conn.id, reason = %reason, "connection lost");
            }
            conn.terminate(&reason, StreamEnd::Reset(reason.clone()));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) async fn connected_pair_with(
        categories: &[Category],
        window: u32,
        config: StreamConfig,
    ) -> (Connection, Connection) {
        let (client_io, server_io) = BridgeStream::pair(1 << 20);
        let handshake = HandshakeConfig {
            window,
            ..HandshakeConfig::default()
        };
        let server_handshake = handshake.clone();
        let server_config = config.clone();
        let server = tokio::spawn(async move {
            Connection::server(
                server_io,
                &Category::ALL,
                "conn-test",
                &server_handshake,
                server_config,
            )
            .await
        });
        let client = Connection::client(client_io, categories, &handshake, config)
            .await
            .expect("client handshake should succeed");
        let server = server
            .await
            .expect("server task should not panic")
            .expect("server handshake should succeed");
        (client, server)
    }

    pub(crate) async fn connected_pair(categories: &[Category], window: u32) -> (Connection, Connection) {
        connected_pair_with(categories, window, StreamConfig::default()).await
    }

    /// Acknowledge every payload on `stream`; yields the timestamps seen.
    pub(crate) fn ack_all(mut stream: ServerStream) -> JoinHandle<Vec<i64>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(Some(frame)) = stream.receive().await {
                seen.push(frame.timestamp());
                let ack = robobridge_message::AckFrame::ok(frame.confirmation());
                if stream.send(&ack).await.is_err() {
                    break;
                }
            }
            seen
        })
    }
}
