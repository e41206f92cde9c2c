//! Bridge session manager.
//!
//! A [`BridgeSession`] owns one [`Connection`] and every category unit
//! running on it: producer loops on the client side, consumer handlers on
//! the server side. Each unit has its own cancellation token derived from
//! the session's, so stopping one category never touches another.
//!
//! Lifecycle: `Idle → Starting → Running → Stopping → Stopped`. Stopping
//! is triggered by [`BridgeSession::stop`] or by loss of the connection and
//! is bounded by [`SessionConfig::grace`]; on expiry the connection is
//! reset and units still running are detached.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use robobridge_frame::StreamId;
use robobridge_message::Category;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Role};
use crate::consumer::{handle, panic_message, HandlerRegistry, HandlerReport};
use crate::error::{PeerError, Result};
use crate::producer::{run_producer, CadenceConfig, ProducerConfig, ProducerReport};
use crate::source::FrameSource;
use crate::stream::{lock, SessionInfo};

/// How long units get to notice a force-close before they are detached.
const RESET_SETTLE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on `Stopping → Stopped`.
    pub grace: Duration,
    /// Producer cadence per category (client side).
    pub cadence: CadenceConfig,
    /// How long an exhausted producer waits for outstanding acks.
    pub drain_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            cadence: CadenceConfig::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// How a category unit ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitResult {
    Producer(ProducerReport),
    Handler(HandlerReport),
    /// The unit returned an error; only its own stream was affected.
    Failed { error: String },
    /// The category stream could not be opened.
    LaunchFailed { error: String },
    Panicked { error: String },
    /// Still running after the grace period and the force-close.
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub category: Category,
    pub stream_id: Option<StreamId>,
    pub result: UnitResult,
}

impl UnitReport {
    pub fn is_failure(&self) -> bool {
        !matches!(
            self.result,
            UnitResult::Producer(_) | UnitResult::Handler(_)
        )
    }
}

/// Outcome of [`BridgeSession::stop`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub connection_id: String,
    pub role: Role,
    pub units: Vec<UnitReport>,
    /// The grace period expired and the connection was reset.
    pub forced: bool,
    pub elapsed_ms: u64,
}

struct Unit {
    category: Category,
    stream_id: Option<StreamId>,
    token: CancellationToken,
    task: JoinHandle<UnitResult>,
}

impl Unit {
    fn is_running(&self) -> bool {
        !self.token.is_cancelled() && !self.task.is_finished()
    }

    fn report(&self, joined: std::result::Result<UnitResult, JoinError>) -> UnitReport {
        let result = match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => UnitResult::Panicked {
                error: panic_message(err.into_panic().as_ref()),
            },
            Err(err) => UnitResult::Failed {
                error: err.to_string(),
            },
        };
        UnitReport {
            category: self.category,
            stream_id: self.stream_id,
            result,
        }
    }
}

/// Decrements the live-unit count when a unit task ends, panics included.
struct LiveGuard(Arc<watch::Sender<usize>>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|live| *live = live.saturating_sub(1));
    }
}

struct SessionInner {
    connection: Arc<Connection>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    live: Arc<watch::Sender<usize>>,
    root: CancellationToken,
    // Lock order: `units` before `finished`.
    units: Mutex<Vec<Unit>>,
    finished: Mutex<Vec<UnitReport>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    /// Serializes start and stop; holds the summary once stopped.
    lifecycle: tokio::sync::Mutex<Option<SessionSummary>>,
}

impl SessionInner {
    fn spawn_unit<F>(&self, category: Category, stream_id: Option<StreamId>, token: CancellationToken, unit: F)
    where
        F: Future<Output = UnitResult> + Send + 'static,
    {
        self.live.send_modify(|live| *live += 1);
        let guard = LiveGuard(Arc::clone(&self.live));
        let task = tokio::spawn(async move {
            let _guard = guard;
            unit.await
        });

        let mut units = lock(&self.units);
        prune(&mut units, &mut lock(&self.finished));
        units.push(Unit {
            category,
            stream_id,
            token,
            task,
        });
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Move finished units out of the running set.
fn prune(units: &mut Vec<Unit>, finished: &mut Vec<UnitReport>) {
    let mut index = 0;
    while index < units.len() {
        if !units[index].task.is_finished() {
            index += 1;
            continue;
        }
        let mut unit = units.swap_remove(index);
        if let Some(joined) = (&mut unit.task).now_or_never() {
            finished.push(unit.report(joined));
        }
    }
}

/// One connection plus the category units running on it.
#[derive(Clone)]
pub struct BridgeSession {
    inner: Arc<SessionInner>,
}

impl BridgeSession {
    pub fn new(connection: Connection, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (live, _) = watch::channel(0);
        Self {
            inner: Arc::new(SessionInner {
                connection: Arc::new(connection),
                config,
                state,
                live: Arc::new(live),
                root: CancellationToken::new(),
                units: Mutex::new(Vec::new()),
                finished: Mutex::new(Vec::new()),
                acceptor: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.connection.id()
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Whether `category` has a unit that is still running and not asked to stop.
    pub fn is_active(&self, category: Category) -> bool {
        lock(&self.inner.units)
            .iter()
            .any(|unit| unit.category == category && unit.is_running())
    }

    /// Stream sessions still registered on the connection.
    pub fn streams(&self) -> Vec<SessionInfo> {
        self.inner.connection.streams()
    }

    /// Open one stream per source and run a producer loop on each.
    ///
    /// A category that cannot be opened is logged and recorded in the
    /// summary; the others still start. Client side only.
    pub async fn start_producers(&self, sources: Vec<Box<dyn FrameSource>>) -> Result<()> {
        let lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(PeerError::InvalidState("session already stopped".to_string()));
        }
        self.begin_start(Role::Client)?;

        let connection = &self.inner.connection;
        for source in sources {
            let category = source.category();
            let stream = match connection.open_stream(category).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(
                        connection_id = connection.id(),
                        category = %category,
                        error = %err,
                        "category stream not opened"
                    );
                    lock(&self.inner.finished).push(UnitReport {
                        category,
                        stream_id: None,
                        result: UnitResult::LaunchFailed {
                            error: err.to_string(),
                        },
                    });
                    continue;
                }
            };

            let stream_id = stream.id();
            let token = self.inner.root.child_token();
            let config = ProducerConfig::for_category(
                category,
                &self.inner.config.cadence,
                self.inner.config.drain_timeout,
            );
            let unit = run_producer(stream, source, config, token.clone()).map(|result| match result {
                Ok(report) => UnitResult::Producer(report),
                Err(err) => UnitResult::Failed {
                    error: err.to_string(),
                },
            });
            self.inner.spawn_unit(category, Some(stream_id), token, unit);
            debug!(connection_id = connection.id(), category = %category, stream_id, "producer started");
        }

        self.finish_start();
        Ok(())
    }

    /// Run a consumer handler for every stream the client opens, using the
    /// registry's processor for its category. Server side only.
    pub async fn start_handlers(&self, registry: HandlerRegistry) -> Result<()> {
        let lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(PeerError::InvalidState("session already stopped".to_string()));
        }
        self.begin_start(Role::Server)?;

        let acceptor = tokio::spawn(accept_loop(
            Arc::clone(&self.inner.connection),
            Arc::downgrade(&self.inner),
            self.inner.root.clone(),
            registry,
        ));
        *lock(&self.inner.acceptor) = Some(acceptor);

        self.finish_start();
        Ok(())
    }

    fn begin_start(&self, role: Role) -> Result<()> {
        let actual = self.inner.connection.role();
        if actual != role {
            return Err(PeerError::InvalidState(format!(
                "a {actual} session cannot start {role} units"
            )));
        }
        let started = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Starting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(PeerError::InvalidState(format!(
                "session is {}, not idle",
                self.state()
            )));
        }
        Ok(())
    }

    fn finish_start(&self) {
        self.watch_connection();
        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Starting {
                *state = SessionState::Running;
                true
            } else {
                false
            }
        });
        info!(
            connection_id = self.id(),
            role = %self.inner.connection.role(),
            units = lock(&self.inner.units).len(),
            "session running"
        );
    }

    /// Stop the session when the connection goes away underneath it.
    fn watch_connection(&self) {
        let closed = self.inner.connection.closed_token();
        let root = self.inner.root.clone();
        let session = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = root.cancelled() => {}
                _ = closed.cancelled() => {
                    if let Some(inner) = session.upgrade() {
                        let session = BridgeSession { inner };
                        info!(
                            connection_id = session.id(),
                            reason = ?session.connection().close_reason(),
                            "connection closed; stopping session"
                        );
                        session.stop().await;
                    }
                }
            }
        });
    }

    /// Resolves once every unit has finished (or immediately if none run).
    pub async fn wait_idle(&self) {
        let mut live = self.inner.live.subscribe();
        let _ = live.wait_for(|live| *live == 0).await;
    }

    pub async fn wait_stopped(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|state| *state == SessionState::Stopped).await;
    }

    /// Clear every category's active flag, close every stream session and
    /// wait for the units to exit, bounded by the grace period.
    ///
    /// Idempotent: later calls return the first call's summary.
    pub async fn stop(&self) -> SessionSummary {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(summary) = lifecycle.as_ref() {
            return summary.clone();
        }

        let connection = &self.inner.connection;
        let grace = self.inner.config.grace;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + grace;
        self.inner.state.send_replace(SessionState::Stopping);
        info!(connection_id = connection.id(), role = %connection.role(), ?grace, "stopping session");

        self.inner.root.cancel();
        let acceptor = lock(&self.inner.acceptor).take();
        if let Some(acceptor) = acceptor {
            let _ = tokio::time::timeout_at(deadline, acceptor).await;
        }
        if tokio::time::timeout_at(deadline, connection.close_streams())
            .await
            .is_err()
        {
            warn!(connection_id = connection.id(), "streams not closed before grace deadline");
        }

        let units = std::mem::take(&mut *lock(&self.inner.units));
        let mut reports = std::mem::take(&mut *lock(&self.inner.finished));
        let mut overdue = Vec::new();
        for mut unit in units {
            match tokio::time::timeout_at(deadline, &mut unit.task).await {
                Ok(joined) => reports.push(unit.report(joined)),
                Err(_) => overdue.push(unit),
            }
        }

        let forced = !overdue.is_empty();
        if forced {
            warn!(
                connection_id = connection.id(),
                units = overdue.len(),
                "grace period expired; force-closing connection"
            );
            connection.reset("session grace period expired");
            let settle = tokio::time::Instant::now() + RESET_SETTLE;
            for mut unit in overdue {
                match tokio::time::timeout_at(settle, &mut unit.task).await {
                    Ok(joined) => reports.push(unit.report(joined)),
                    Err(_) => {
                        warn!(
                            connection_id = connection.id(),
                            category = %unit.category,
                            stream_id = ?unit.stream_id,
                            "unit still running after force-close; detached"
                        );
                        reports.push(UnitReport {
                            category: unit.category,
                            stream_id: unit.stream_id,
                            result: UnitResult::Detached,
                        });
                    }
                }
            }
        } else if tokio::time::timeout_at(deadline, connection.close("session stopped"))
            .await
            .is_err()
        {
            connection.reset("session stopped");
        }

        reports.sort_by_key(|report| (report.stream_id, report.category));
        let summary = SessionSummary {
            connection_id: connection.id().to_string(),
            role: connection.role(),
            units: reports,
            forced,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        self.inner.state.send_replace(SessionState::Stopped);
        info!(
            connection_id = connection.id(),
            units = summary.units.len(),
            failures = summary.units.iter().filter(|unit| unit.is_failure()).count(),
            forced,
            elapsed_ms = summary.elapsed_ms,
            "session stopped"
        );
        *lifecycle = Some(summary.clone());
        summary
    }
}

impl fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSession")
            .field("connection_id", &self.id())
            .field("role", &self.inner.connection.role())
            .field("state", &self.state())
            .finish()
    }
}

async fn accept_loop(
    connection: Arc<Connection>,
    session: Weak<SessionInner>,
    root: CancellationToken,
    registry: HandlerRegistry,
) {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = root.cancelled() => break,
            inbound = connection.accept_stream() => inbound,
        };
        let Some(stream) = inbound else {
            break;
        };
        let Some(inner) = session.upgrade() else {
            break;
        };

        let category = stream.category();
        let stream_id = stream.id();
        let token = root.child_token();
        let unit = handle(stream, registry.processor_for(category), token.clone()).map(|result| match result {
            Ok(report) => UnitResult::Handler(report),
            Err(err) => UnitResult::Failed {
                error: err.to_string(),
            },
        });
        inner.spawn_unit(category, Some(stream_id), token, unit);
        debug!(connection_id = connection.id(), category = %category, stream_id, "handler started");
    }
    debug!(connection_id = connection.id(), "stream acceptor finished");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use robobridge_message::PayloadFrame;

    use super::*;
    use crate::connection::testing::connected_pair;
    use crate::consumer::{BroadcastProcessor, FrameProcessor, HandlerOutcome};
    use crate::error::ProcessingError;
    use crate::producer::ProducerOutcome;
    use crate::source::SampleSource;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            grace: Duration::from_secs(2),
            cadence: CadenceConfig::uniform(Duration::from_millis(2)),
            drain_timeout: Duration::from_secs(2),
        }
    }

    fn samples(categories: &[Category], limit: Option<u64>) -> Vec<Box<dyn FrameSource>> {
        categories
            .iter()
            .map(|&category| {
                let source = SampleSource::new(category);
                let source = match limit {
                    Some(limit) => source.with_limit(limit),
                    None => source,
                };
                Box::new(source) as Box<dyn FrameSource>
            })
            .collect()
    }

    async fn sessions(categories: &[Category], registry: HandlerRegistry) -> (BridgeSession, BridgeSession) {
        let (client, server) = connected_pair(categories, 8).await;
        let server = BridgeSession::new(server, fast_config());
        server
            .start_handlers(registry)
            .await
            .expect("server session should start");
        (BridgeSession::new(client, fast_config()), server)
    }

    struct FailingProcessor {
        fail_at: u64,
        seen: AtomicU64,
    }

    #[async_trait]
    impl FrameProcessor for FailingProcessor {
        async fn process(&self, _frame: &PayloadFrame) -> std::result::Result<(), ProcessingError> {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
                return Err(ProcessingError::new("Simulated processing error"));
            }
            Ok(())
        }
    }

    struct StuckProcessor;

    #[async_trait]
    impl FrameProcessor for StuckProcessor {
        async fn process(&self, _frame: &PayloadFrame) -> std::result::Result<(), ProcessingError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_clears_every_flag_within_grace() {
        let (client, server) = sessions(&Category::ALL, HandlerRegistry::default()).await;
        client
            .start_producers(samples(&Category::ALL, None))
            .await
            .unwrap();
        assert_eq!(client.state(), SessionState::Running);
        for category in Category::ALL {
            assert!(client.is_active(category), "{category} should be active");
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        let summary = tokio::time::timeout(Duration::from_secs(3), client.stop())
            .await
            .expect("stop should finish within grace");

        assert!(!summary.forced);
        assert_eq!(summary.units.len(), 3);
        for unit in &summary.units {
            assert!(
                matches!(&unit.result, UnitResult::Producer(report) if report.outcome == ProducerOutcome::Stopped),
                "unexpected unit result {unit:?}"
            );
        }
        for category in Category::ALL {
            assert!(!client.is_active(category));
        }
        assert!(client.streams().is_empty());
        assert_eq!(client.state(), SessionState::Stopped);
        assert!(client.connection().is_closed());

        tokio::time::timeout(Duration::from_secs(3), server.wait_stopped())
            .await
            .expect("server session should stop when the client leaves");
        let server_summary = server.stop().await;
        assert_eq!(server_summary.units.len(), 3);
        assert!(server_summary.units.iter().all(|unit| matches!(
            &unit.result,
            UnitResult::Handler(report)
                if matches!(report.outcome, HandlerOutcome::PeerClosed | HandlerOutcome::Stopped)
        )));

        let again = client.stop().await;
        assert_eq!(again.units, summary.units);
    }

    #[tokio::test]
    async fn three_categories_five_frames_each_yield_fifteen_acks() {
        let broadcast = Arc::new(BroadcastProcessor::new(64));
        let mut published = broadcast.subscribe();
        let (client, server) = sessions(&Category::ALL, HandlerRegistry::new(broadcast)).await;

        client
            .start_producers(samples(&Category::ALL, Some(5)))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.wait_idle())
            .await
            .expect("producers should drain");

        let summary = client.stop().await;
        let mut acked = 0;
        for unit in &summary.units {
            match &unit.result {
                UnitResult::Producer(report) => {
                    assert_eq!(report.outcome, ProducerOutcome::SourceExhausted);
                    assert_eq!(report.sent, 5);
                    assert_eq!(report.acked, 5);
                    acked += report.acked;
                }
                other => panic!("unexpected unit result {other:?}"),
            }
        }
        assert_eq!(acked, 15);

        let mut per_category: HashMap<Category, Vec<i64>> = HashMap::new();
        for _ in 0..15 {
            let frame = published.recv().await.unwrap();
            per_category
                .entry(frame.category())
                .or_default()
                .push(frame.timestamp());
        }
        for category in Category::ALL {
            let stamps = &per_category[&category];
            assert_eq!(stamps.len(), 5);
            assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn failing_category_does_not_disturb_siblings() {
        let registry = HandlerRegistry::default().with(
            Category::Sensor,
            Arc::new(FailingProcessor {
                fail_at: 2,
                seen: AtomicU64::new(0),
            }),
        );
        let (client, server) = sessions(&Category::ALL, registry).await;
        client
            .start_producers(samples(&Category::ALL, Some(5)))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.wait_idle())
            .await
            .expect("producers should finish");

        let summary = client.stop().await;
        for unit in &summary.units {
            match (unit.category, &unit.result) {
                (Category::Sensor, UnitResult::Failed { .. }) => {}
                (_, UnitResult::Producer(report)) if unit.category != Category::Sensor => {
                    assert_eq!(report.acked, 5);
                }
                (category, result) => panic!("unexpected {category} result {result:?}"),
            }
        }

        let server_summary = server.stop().await;
        let sensor = server_summary
            .units
            .iter()
            .find(|unit| unit.category == Category::Sensor)
            .unwrap();
        assert_eq!(
            sensor.result,
            UnitResult::Failed {
                error: "processing failed: Simulated processing error".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unopenable_category_is_recorded_and_others_run() {
        let (client, server) =
            sessions(&[Category::Sensor, Category::Pose], HandlerRegistry::default()).await;
        client
            .start_producers(samples(&Category::ALL, Some(2)))
            .await
            .unwrap();
        assert!(!client.is_active(Category::Image));

        tokio::time::timeout(Duration::from_secs(5), client.wait_idle())
            .await
            .expect("producers should finish");
        let summary = client.stop().await;

        assert_eq!(summary.units.len(), 3);
        let image = &summary.units[0];
        assert_eq!(image.category, Category::Image);
        assert_eq!(image.stream_id, None);
        assert!(matches!(image.result, UnitResult::LaunchFailed { .. }));
        assert!(summary.units[1..]
            .iter()
            .all(|unit| matches!(&unit.result, UnitResult::Producer(report) if report.acked == 2)));
        server.stop().await;
    }

    #[tokio::test]
    async fn sessions_start_once_and_only_in_their_role() {
        let (client, server) = connected_pair(&Category::ALL, 8).await;
        let client = BridgeSession::new(client, fast_config());
        let server = BridgeSession::new(server, fast_config());

        assert!(matches!(
            client.start_handlers(HandlerRegistry::default()).await,
            Err(PeerError::InvalidState(_))
        ));
        assert!(matches!(
            server.start_producers(Vec::new()).await,
            Err(PeerError::InvalidState(_))
        ));

        client.start_producers(Vec::new()).await.unwrap();
        assert!(matches!(
            client.start_producers(Vec::new()).await,
            Err(PeerError::InvalidState(_))
        ));

        client.stop().await;
        server.stop().await;
        assert!(matches!(
            server.start_handlers(HandlerRegistry::default()).await,
            Err(PeerError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn connection_loss_stops_the_session() {
        let (client, server) = connected_pair(&Category::ALL, 4).await;
        let client = BridgeSession::new(client, fast_config());
        client
            .start_producers(samples(&[Category::Sensor, Category::Pose], None))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.reset("simulated outage");

        tokio::time::timeout(Duration::from_secs(3), client.wait_stopped())
            .await
            .expect("session should stop after connection loss");
        let summary = client.stop().await;
        assert_eq!(summary.units.len(), 2);
        assert!(summary
            .units
            .iter()
            .all(|unit| matches!(unit.result, UnitResult::Failed { .. })));
    }

    #[tokio::test]
    async fn overdue_units_are_detached_after_force_close() {
        let (client, server) = connected_pair(&Category::ALL, 8).await;
        let server = BridgeSession::new(
            server,
            SessionConfig {
                grace: Duration::from_millis(100),
                ..fast_config()
            },
        );
        server
            .start_handlers(HandlerRegistry::new(Arc::new(StuckProcessor)))
            .await
            .unwrap();

        let stream = client.open_stream(Category::Sensor).await.unwrap();
        stream
            .send(&PayloadFrame::sample(Category::Sensor, 1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.is_active(Category::Sensor));

        let started = Instant::now();
        let summary = server.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(summary.forced);
        assert_eq!(summary.units.len(), 1);
        assert_eq!(summary.units[0].result, UnitResult::Detached);
        assert!(server.connection().is_closed());

        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("client should observe the force-close");
    }
}
