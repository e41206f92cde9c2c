//! Server-side consumer handler: one per accepted category stream.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use robobridge_frame::StreamId;
use robobridge_message::{AbortStatus, AckFrame, Category, PayloadFrame, StatusCode};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{PeerError, ProcessingError, Result};
use crate::stream::ServerStream;

/// Application logic run for every received payload.
///
/// Returning an error (or panicking) aborts the payload's stream; other
/// streams on the connection are unaffected.
#[async_trait]
pub trait FrameProcessor: Send + Sync {
    async fn process(&self, frame: &PayloadFrame) -> std::result::Result<(), ProcessingError>;
}

/// Logs what was received.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProcessor;

#[async_trait]
impl FrameProcessor for LoggingProcessor {
    async fn process(&self, frame: &PayloadFrame) -> std::result::Result<(), ProcessingError> {
        info!(
            category = %frame.category(),
            timestamp = frame.timestamp(),
            "received {}",
            frame.summary()
        );
        Ok(())
    }
}

/// Publishes every payload on a broadcast channel for downstream observers.
#[derive(Debug, Clone)]
pub struct BroadcastProcessor {
    tx: broadcast::Sender<PayloadFrame>,
}

impl BroadcastProcessor {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PayloadFrame> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl FrameProcessor for BroadcastProcessor {
    async fn process(&self, frame: &PayloadFrame) -> std::result::Result<(), ProcessingError> {
        match self.tx.send(frame.clone()) {
            Ok(receivers) => debug!(receivers, category = %frame.category(), "payload published"),
            Err(_) => debug!(category = %frame.category(), "no subscribers for payload"),
        }
        Ok(())
    }
}

/// Maps each category to the processor that handles it.
#[derive(Clone)]
pub struct HandlerRegistry {
    processors: HashMap<Category, Arc<dyn FrameProcessor>>,
    fallback: Arc<dyn FrameProcessor>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(LoggingProcessor))
    }
}

impl HandlerRegistry {
    /// Registry where every category uses `fallback` until overridden.
    pub fn new(fallback: Arc<dyn FrameProcessor>) -> Self {
        Self {
            processors: HashMap::new(),
            fallback,
        }
    }

    pub fn with(mut self, category: Category, processor: Arc<dyn FrameProcessor>) -> Self {
        self.register(category, processor);
        self
    }

    pub fn register(&mut self, category: Category, processor: Arc<dyn FrameProcessor>) {
        self.processors.insert(category, processor);
    }

    pub fn processor_for(&self, category: Category) -> Arc<dyn FrameProcessor> {
        self.processors
            .get(&category)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut overridden: Vec<Category> = self.processors.keys().copied().collect();
        overridden.sort();
        f.debug_struct("HandlerRegistry")
            .field("overridden", &overridden)
            .finish_non_exhaustive()
    }
}

/// Why a handler finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// The client ended the stream.
    PeerClosed,
    /// The category's active flag was cleared.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerReport {
    pub category: Category,
    pub stream_id: StreamId,
    pub received: u64,
    pub acked: u64,
    pub outcome: HandlerOutcome,
}

/// Process every payload on `stream` in arrival order, acknowledging each
/// one exactly once.
///
/// A processing failure aborts the stream with an `internal` status and no
/// further acks; a malformed payload aborts it with `invalid_argument`.
pub async fn handle(
    mut stream: ServerStream,
    processor: Arc<dyn FrameProcessor>,
    active: CancellationToken,
) -> Result<HandlerReport> {
    let info = stream.info();
    let span = info_span!(
        "handler",
        category = %info.category,
        connection_id = %info.connection_id,
        stream_id = info.stream_id
    );

    async move {
        let mut received = 0u64;
        let mut acked = 0u64;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = active.cancelled() => break HandlerOutcome::Stopped,
                next = stream.receive() => next,
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break HandlerOutcome::PeerClosed,
                Err(PeerError::Message(err)) => {
                    error!(error = %err, received, "malformed payload; aborting stream");
                    let status = AbortStatus::new(StatusCode::InvalidArgument, err.to_string());
                    if let Err(abort_err) = stream.abort(status).await {
                        warn!(error = %abort_err, "abort not delivered");
                    }
                    return Err(PeerError::Message(err));
                }
                Err(err) => {
                    error!(error = %err, received, acked, "stream failed");
                    return Err(err);
                }
            };
            received += 1;

            let result = AssertUnwindSafe(processor.process(&frame))
                .catch_unwind()
                .await;
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(message) = failure {
                error!(error = %message, timestamp = frame.timestamp(), received, "error processing payload; aborting stream");
                if let Err(abort_err) = stream.abort(AbortStatus::internal(&message)).await {
                    warn!(error = %abort_err, "abort not delivered");
                }
                return Err(PeerError::Processing(message));
            }

            match stream.send(&AckFrame::ok(frame.confirmation())).await {
                Ok(()) => acked += 1,
                Err(PeerError::ChannelClosed) => break HandlerOutcome::PeerClosed,
                Err(err) => {
                    error!(error = %err, received, acked, "ack not sent");
                    return Err(err);
                }
            }
        };

        let _ = stream.close().await;
        info!(received, acked, outcome = ?outcome, "handler finished");
        Ok(HandlerReport {
            category: info.category,
            stream_id: info.stream_id,
            received,
            acked,
            outcome,
        })
    }
    .instrument(span)
    .await
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic with non-string payload".to_string()
    }
}
