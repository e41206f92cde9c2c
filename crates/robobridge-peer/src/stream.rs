//! Typed category streams multiplexed over one [`Connection`](crate::Connection).
//!
//! A stream session carries payloads one way and acknowledgements the other.
//! The client holds a [`ClientStream`] (sends [`PayloadFrame`], receives
//! [`AckFrame`]); the server holds the mirror image, a [`ServerStream`].
//!
//! Acknowledgements double as flow-control credit: a client may have at most
//! `window` payloads outstanding, and `send` waits until the producer has
//! consumed an ack before it writes another one.

use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use robobridge_frame::{FrameError, FrameKind, StreamId};
use robobridge_message::{AbortStatus, AckFrame, Category, PayloadFrame};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use crate::connection::ConnectionShared;
use crate::error::{PeerError, Result};

/// A message type that travels in one direction of a stream.
pub trait WireMessage: Sized + Send + 'static {
    /// Frame kind used on the wire.
    const KIND: FrameKind;

    /// Encode for a stream of `category`.
    fn encode_wire(&self, category: Category) -> Result<Bytes>;

    /// Decode a frame received on a stream of `category`.
    fn decode_wire(category: Category, payload: &[u8]) -> Result<Self>;
}

impl WireMessage for PayloadFrame {
    const KIND: FrameKind = FrameKind::Payload;

    fn encode_wire(&self, category: Category) -> Result<Bytes> {
        self.ensure_category(category)?;
        Ok(Bytes::from(self.encode()?))
    }

    fn decode_wire(category: Category, payload: &[u8]) -> Result<Self> {
        Ok(PayloadFrame::decode(category, payload)?)
    }
}

impl WireMessage for AckFrame {
    const KIND: FrameKind = FrameKind::Ack;

    fn encode_wire(&self, _category: Category) -> Result<Bytes> {
        Ok(Bytes::from(self.encode()?))
    }

    fn decode_wire(_category: Category, payload: &[u8]) -> Result<Self> {
        Ok(AckFrame::decode(payload)?)
    }
}

/// Client end of a category stream.
pub type ClientStream = StreamChannel<PayloadFrame, AckFrame>;
/// Server end of a category stream.
pub type ServerStream = StreamChannel<AckFrame, PayloadFrame>;

/// Lifecycle of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Open,
    Closing,
    Closed,
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// How a stream session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEnd {
    /// Closed (or aborted) from this side.
    Closed,
    /// The peer signalled end-of-stream.
    EndedByPeer,
    /// Aborted with a status, by the peer or on its behalf.
    Aborted(AbortStatus),
    /// The connection went away underneath the stream.
    Reset(String),
}

/// Snapshot of one stream session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub connection_id: String,
    pub stream_id: StreamId,
    pub category: Category,
    pub state: StreamState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<StreamEnd>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by both halves of a stream and the connection reader.
pub(crate) struct StreamShared {
    pub(crate) id: StreamId,
    pub(crate) category: Category,
    connection_id: Arc<str>,
    state: AtomicU8,
    end: Mutex<Option<StreamEnd>>,
    credits: Option<Semaphore>,
    window: usize,
}

impl StreamShared {
    pub(crate) fn new(
        id: StreamId,
        category: Category,
        connection_id: Arc<str>,
        window: usize,
        credited: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            category,
            connection_id,
            state: AtomicU8::new(OPEN),
            end: Mutex::new(None),
            credits: credited.then(|| Semaphore::new(window)),
            window,
        })
    }

    pub(crate) fn state(&self) -> StreamState {
        match self.state.load(Ordering::Acquire) {
            OPEN => StreamState::Open,
            CLOSING => StreamState::Closing,
            _ => StreamState::Closed,
        }
    }

    /// Move `Open` to `Closing`. False if some other path got there first.
    pub(crate) fn begin_closing(&self) -> bool {
        self.state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record how the stream ended. The first recorded end wins.
    pub(crate) fn finish(&self, end: StreamEnd) -> bool {
        let first = {
            let mut slot = lock(&self.end);
            let first = slot.is_none();
            if first {
                *slot = Some(end);
            }
            first
        };
        self.state.store(CLOSED, Ordering::Release);
        if let Some(credits) = &self.credits {
            credits.close();
        }
        first
    }

    pub(crate) fn end(&self) -> Option<StreamEnd> {
        lock(&self.end).clone()
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            connection_id: self.connection_id.to_string(),
            stream_id: self.id,
            category: self.category,
            state: self.state(),
            end: self.end(),
        }
    }

    fn release_credit(&self) {
        if let Some(credits) = &self.credits {
            if credits.available_permits() < self.window {
                credits.add_permits(1);
            }
        }
    }

    /// Result reported by `receive` once the inbound queue is exhausted.
    fn terminal<T>(&self) -> Result<Option<T>> {
        match self.end() {
            Some(StreamEnd::Aborted(status)) => Err(PeerError::Aborted(status)),
            Some(StreamEnd::Reset(reason)) => Err(PeerError::Disconnected(reason)),
            _ => Ok(None),
        }
    }
}

struct StreamHandle {
    shared: Arc<StreamShared>,
    conn: Arc<ConnectionShared>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.conn.close_stream_now(&self.shared);
    }
}

/// Sending half of a stream. Clones share the same stream.
pub struct StreamSender<Tx> {
    handle: Arc<StreamHandle>,
    _tx: PhantomData<fn(Tx)>,
}

impl<Tx> Clone for StreamSender<Tx> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
            _tx: PhantomData,
        }
    }
}

impl<Tx: WireMessage> StreamSender<Tx> {
    /// Enqueue one message for in-order delivery.
    ///
    /// A message that encodes past the connection's frame cap is refused
    /// with [`FrameError::PayloadTooLarge`] and the stream stays open.
    /// Waits while the stream's window is exhausted. Fails with
    /// [`PeerError::ChannelClosed`] once the stream is closed from either
    /// side, and with [`PeerError::ChannelFull`] if a configured send
    /// timeout elapses first.
    pub async fn send(&self, message: &Tx) -> Result<()> {
        match self.handle.conn.config.send_timeout {
            Some(limit) => tokio::time::timeout(limit, self.send_inner(message))
                .await
                .map_err(|_| PeerError::ChannelFull {
                    stream: self.handle.shared.id,
                    waited: limit,
                })?,
            None => self.send_inner(message).await,
        }
    }

    async fn send_inner(&self, message: &Tx) -> Result<()> {
        let shared = &self.handle.shared;
        if shared.state() != StreamState::Open {
            return Err(PeerError::ChannelClosed);
        }
        let payload = message.encode_wire(shared.category)?;
        let max = self.handle.conn.config.max_payload_size;
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max,
            }
            .into());
        }

        let permit = match &shared.credits {
            Some(credits) => Some(
                credits
                    .acquire()
                    .await
                    .map_err(|_| PeerError::ChannelClosed)?,
            ),
            None => None,
        };
        if shared.state() != StreamState::Open {
            return Err(PeerError::ChannelClosed);
        }

        self.handle
            .conn
            .enqueue(robobridge_frame::Frame::new(shared.id, Tx::KIND, payload))
            .await?;
        if let Some(permit) = permit {
            // Returned by the receiver when the matching ack is consumed.
            permit.forget();
        }
        Ok(())
    }

    /// Wait until every payload sent so far has been acknowledged.
    ///
    /// Acks are only counted once the receiving half consumes them, so
    /// something must keep reading the receiver while this waits. Returns
    /// immediately on streams without flow control.
    pub async fn wait_drained(&self) -> Result<()> {
        let shared = &self.handle.shared;
        let Some(credits) = &shared.credits else {
            return Ok(());
        };
        let window = u32::try_from(shared.window).unwrap_or(u32::MAX);
        let _all = credits
            .acquire_many(window)
            .await
            .map_err(|_| PeerError::ChannelClosed)?;
        Ok(())
    }

    /// Signal end-of-stream to the peer. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.handle.conn.close_stream(&self.handle.shared).await;
        Ok(())
    }

    /// Abort the stream with a status the peer will see.
    pub async fn abort(&self, status: AbortStatus) -> Result<()> {
        self.handle
            .conn
            .abort_stream(&self.handle.shared, status)
            .await
    }

    pub fn info(&self) -> SessionInfo {
        self.handle.shared.info()
    }

    pub fn id(&self) -> StreamId {
        self.handle.shared.id
    }

    pub fn category(&self) -> Category {
        self.handle.shared.category
    }

    pub fn state(&self) -> StreamState {
        self.handle.shared.state()
    }
}

/// Receiving half of a stream; also a [`Stream`] of decoded messages.
pub struct StreamReceiver<Rx> {
    handle: Arc<StreamHandle>,
    inbound: mpsc::Receiver<Bytes>,
    finished: bool,
    _rx: PhantomData<fn() -> Rx>,
}

impl<Rx: WireMessage> StreamReceiver<Rx> {
    /// Next message, or `Ok(None)` once the stream ended normally.
    ///
    /// Messages already delivered are always drained before the terminal
    /// result: a peer abort surfaces as [`PeerError::Aborted`], a lost
    /// connection as [`PeerError::Disconnected`].
    pub async fn receive(&mut self) -> Result<Option<Rx>> {
        let next = match self.handle.conn.config.receive_timeout {
            Some(limit) => tokio::time::timeout(limit, self.inbound.recv())
                .await
                .map_err(|_| PeerError::Timeout(limit))?,
            None => self.inbound.recv().await,
        };
        self.decode(next)
    }

    fn decode(&mut self, next: Option<Bytes>) -> Result<Option<Rx>> {
        let shared = &self.handle.shared;
        match next {
            Some(payload) => {
                shared.release_credit();
                Rx::decode_wire(shared.category, &payload).map(Some)
            }
            None => {
                self.finished = true;
                shared.terminal()
            }
        }
    }

    pub fn info(&self) -> SessionInfo {
        self.handle.shared.info()
    }
}

impl<Rx: WireMessage> Stream for StreamReceiver<Rx> {
    type Item = Result<Rx>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.inbound.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(next) => Poll::Ready(this.decode(next).transpose()),
        }
    }
}

/// One stream session: a typed sending half and receiving half.
pub struct StreamChannel<Tx, Rx> {
    sender: StreamSender<Tx>,
    receiver: StreamReceiver<Rx>,
}

impl<Tx: WireMessage, Rx: WireMessage> StreamChannel<Tx, Rx> {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        conn: Arc<ConnectionShared>,
        inbound: mpsc::Receiver<Bytes>,
    ) -> Self {
        let handle = Arc::new(StreamHandle { shared, conn });
        Self {
            sender: StreamSender {
                handle: Arc::clone(&handle),
                _tx: PhantomData,
            },
            receiver: StreamReceiver {
                handle,
                inbound,
                finished: false,
                _rx: PhantomData,
            },
        }
    }

    /// See [`StreamSender::send`].
    pub async fn send(&self, message: &Tx) -> Result<()> {
        self.sender.send(message).await
    }

    /// See [`StreamReceiver::receive`].
    pub async fn receive(&mut self) -> Result<Option<Rx>> {
        self.receiver.receive().await
    }

    /// See [`StreamSender::close`].
    pub async fn close(&self) -> Result<()> {
        self.sender.close().await
    }

    /// See [`StreamSender::abort`].
    pub async fn abort(&self, status: AbortStatus) -> Result<()> {
        self.sender.abort(status).await
    }

    /// See [`StreamSender::wait_drained`].
    pub async fn wait_drained(&self) -> Result<()> {
        self.sender.wait_drained().await
    }

    /// Abort without waiting for queue space.
    pub(crate) fn abort_now(&self, status: AbortStatus) {
        let handle = &self.sender.handle;
        handle.conn.abort_stream_now(&handle.shared, status);
    }

    pub fn split(self) -> (StreamSender<Tx>, StreamReceiver<Rx>) {
        (self.sender, self.receiver)
    }

    pub fn info(&self) -> SessionInfo {
        self.sender.info()
    }

    pub fn id(&self) -> StreamId {
        self.sender.id()
    }

    pub fn category(&self) -> Category {
        self.sender.category()
    }

    pub fn state(&self) -> StreamState {
        self.sender.state()
    }
}

impl<Tx, Rx> fmt::Debug for StreamChannel<Tx, Rx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.sender.handle.shared;
        f.debug_struct("StreamChannel")
            .field("connection_id", &shared.connection_id)
            .field("stream_id", &shared.id)
            .field("category", &shared.category)
            .field("state", &shared.state())
            .finish()
    }
}
