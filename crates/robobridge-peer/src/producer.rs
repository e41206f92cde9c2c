//! Client-side producer loop: one per category stream.

use std::time::Duration;

use robobridge_frame::StreamId;
use robobridge_message::Category;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{PeerError, Result};
use crate::source::FrameSource;
use crate::stream::{ClientStream, StreamEnd};

const MIN_CADENCE: Duration = Duration::from_millis(1);

/// Send cadence per category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CadenceConfig {
    pub sensor: Duration,
    pub pose: Duration,
    pub image: Duration,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            sensor: Duration::from_millis(1000),
            pose: Duration::from_millis(100),
            image: Duration::from_millis(33),
        }
    }
}

impl CadenceConfig {
    /// The same cadence for every category.
    pub fn uniform(period: Duration) -> Self {
        Self {
            sensor: period,
            pose: period,
            image: period,
        }
    }

    pub fn interval(&self, category: Category) -> Duration {
        match category {
            Category::Sensor => self.sensor,
            Category::Pose => self.pose,
            Category::Image => self.image,
        }
    }
}

/// Settings for one producer loop.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Time between payloads. Ticks missed under backpressure are delayed,
    /// never sent in a burst.
    pub cadence: Duration,
    /// How long an exhausted source waits for outstanding acks.
    pub drain_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ProducerConfig {
    pub fn for_category(category: Category, cadence: &CadenceConfig, drain_timeout: Duration) -> Self {
        Self {
            cadence: cadence.interval(category),
            drain_timeout,
        }
    }
}

/// Why a producer loop finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerOutcome {
    /// The category's active flag was cleared.
    Stopped,
    /// The source ran dry and the stream was closed.
    SourceExhausted,
    /// The server ended the stream.
    PeerClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerReport {
    pub category: Category,
    pub stream_id: StreamId,
    pub sent: u64,
    pub acked: u64,
    pub outcome: ProducerOutcome,
}

/// Drive one category stream until `active` is cancelled, the source is
/// exhausted, or the peer ends the stream.
///
/// Payloads are sent on the cadence while acks are read concurrently. An
/// abort from the peer or a lost connection ends only this stream and is
/// returned as the error.
pub async fn run_producer(
    stream: ClientStream,
    mut source: Box<dyn FrameSource>,
    config: ProducerConfig,
    active: CancellationToken,
) -> Result<ProducerReport> {
    let info = stream.info();
    let span = info_span!(
        "producer",
        category = %info.category,
        connection_id = %info.connection_id,
        stream_id = info.stream_id
    );

    async move {
        let (sender, mut receiver) = stream.split();
        let local = active.child_token();

        let acks = async {
            let mut acked = 0u64;
            loop {
                match receiver.receive().await {
                    Ok(Some(ack)) => {
                        acked += 1;
                        if ack.success {
                            info!(message = %ack.message, acked, "ack received");
                        } else {
                            warn!(message = %ack.message, acked, "negative ack received");
                        }
                    }
                    Ok(None) => {
                        let peer_ended = receiver.info().end == Some(StreamEnd::EndedByPeer);
                        if peer_ended {
                            local.cancel();
                        }
                        return (acked, Ok(peer_ended));
                    }
                    Err(err) => {
                        local.cancel();
                        return (acked, Err(err));
                    }
                }
            }
        };

        let sends = async {
            let mut sent = 0u64;
            let mut ticker = tokio::time::interval(config.cadence.max(MIN_CADENCE));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let outcome = 'produce: loop {
                tokio::select! {
                    biased;
                    _ = local.cancelled() => break Ok(ProducerOutcome::Stopped),
                    _ = ticker.tick() => {}
                }
                let next = tokio::select! {
                    biased;
                    _ = local.cancelled() => break Ok(ProducerOutcome::Stopped),
                    next = source.next_frame() => next,
                };
                let Some(frame) = next else {
                    debug!(sent, "source exhausted; waiting for outstanding acks");
                    if tokio::time::timeout(config.drain_timeout, sender.wait_drained())
                        .await
                        .is_err()
                    {
                        warn!(sent, timeout = ?config.drain_timeout, "acks still outstanding at drain timeout");
                    }
                    break Ok(ProducerOutcome::SourceExhausted);
                };

                loop {
                    let result = tokio::select! {
                        biased;
                        _ = local.cancelled() => break 'produce Ok(ProducerOutcome::Stopped),
                        result = sender.send(&frame) => result,
                    };
                    match result {
                        Ok(()) => {
                            sent += 1;
                            debug!(timestamp = frame.timestamp(), sent, "payload sent");
                            break;
                        }
                        Err(PeerError::ChannelClosed) => break 'produce Ok(ProducerOutcome::PeerClosed),
                        Err(err) if err.is_retryable() => {
                            warn!(error = %err, "send blocked by backpressure; retrying");
                        }
                        Err(err) => break 'produce Err(err),
                    }
                }
            };

            let _ = sender.close().await;
            (sent, outcome)
        };

        let ((sent, outcome), (acked, ack_result)) = tokio::join!(sends, acks);

        let outcome = match (outcome, ack_result) {
            (_, Err(err)) | (Err(err), Ok(_)) => {
                error!(error = %err, sent, acked, "producer failed");
                return Err(err);
            }
            (Ok(ProducerOutcome::Stopped), Ok(true)) => ProducerOutcome::PeerClosed,
            (Ok(outcome), Ok(_)) => outcome,
        };

        info!(sent, acked, outcome = ?outcome, "producer finished");
        Ok(ProducerReport {
            category: info.category,
            stream_id: info.stream_id,
            sent,
            acked,
            outcome,
        })
    }
    .instrument(span)
    .await
}
