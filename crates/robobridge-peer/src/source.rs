//! Where producer loops get their payloads from.

use async_trait::async_trait;
use robobridge_message::{Category, PayloadFrame, TimestampClock};
use tokio::sync::mpsc;
use tracing::warn;

/// A supplier of payloads for one category.
///
/// `None` means the source is exhausted; the producer then drains
/// outstanding acks and closes its stream.
#[async_trait]
pub trait FrameSource: Send {
    fn category(&self) -> Category;

    async fn next_frame(&mut self) -> Option<PayloadFrame>;
}

/// Generates the category's sample payload with a fresh timestamp each time.
#[derive(Debug)]
pub struct SampleSource {
    category: Category,
    clock: TimestampClock,
    limit: Option<u64>,
    produced: u64,
}

impl SampleSource {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            clock: TimestampClock::new(),
            limit: None,
            produced: 0,
        }
    }

    /// Stop after `limit` payloads.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
impl FrameSource for SampleSource {
    fn category(&self) -> Category {
        self.category
    }

    async fn next_frame(&mut self) -> Option<PayloadFrame> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return None;
        }
        self.produced += 1;
        Some(PayloadFrame::sample(self.category, self.clock.next()))
    }
}

/// Forwards payloads pushed by an upstream task.
///
/// Payloads of another category are logged and skipped. The source is
/// exhausted once every sender is dropped.
#[derive(Debug)]
pub struct ChannelSource {
    category: Category,
    rx: mpsc::Receiver<PayloadFrame>,
}

impl ChannelSource {
    pub fn new(category: Category, rx: mpsc::Receiver<PayloadFrame>) -> Self {
        Self { category, rx }
    }

    /// A source plus the sender that feeds it.
    pub fn channel(category: Category, capacity: usize) -> (Self, mpsc::Sender<PayloadFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(category, rx), tx)
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    fn category(&self) -> Category {
        self.category
    }

    async fn next_frame(&mut self) -> Option<PayloadFrame> {
        loop {
            let frame = self.rx.recv().await?;
            if frame.category() == self.category {
                return Some(frame);
            }
            warn!(
                expected = %self.category,
                found = %frame.category(),
                "skipping payload for another category"
            );
        }
    }
}
