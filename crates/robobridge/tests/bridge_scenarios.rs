use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use robobridge::message::{Category, PayloadFrame};
use robobridge::peer::{
    connect, BridgeListener, BridgeSession, BroadcastProcessor, CadenceConfig, FrameSource,
    HandlerRegistry, ListenerConfig, ProducerOutcome, SampleSource, SessionConfig, SessionState,
    UnitResult,
};
use tokio_util::sync::CancellationToken;

async fn start_listener(
    registry: HandlerRegistry,
) -> (String, CancellationToken, tokio::task::JoinHandle<robobridge::peer::ListenerSummary>) {
    let listener = BridgeListener::bind(ListenerConfig {
        addr: "127.0.0.1:0".to_string(),
        ..ListenerConfig::default()
    })
    .await
    .expect("listener should bind");
    let addr = listener.local_addr().to_string();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        listener
            .serve(registry, token)
            .await
            .expect("serve should finish cleanly")
    });
    (addr, shutdown, task)
}

fn fast_session() -> SessionConfig {
    SessionConfig {
        grace: Duration::from_secs(2),
        cadence: CadenceConfig::uniform(Duration::from_millis(5)),
        drain_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn every_category_reaches_the_consumer_and_is_acknowledged() {
    let broadcast = Arc::new(BroadcastProcessor::new(64));
    let mut received = broadcast.subscribe();
    let (addr, shutdown, server) = start_listener(HandlerRegistry::new(broadcast)).await;

    let connection = connect(&addr, &Category::ALL)
        .await
        .expect("client should connect");
    let session = BridgeSession::new(connection, fast_session());
    let sources = Category::ALL
        .iter()
        .map(|&category| Box::new(SampleSource::new(category).with_limit(4)) as Box<dyn FrameSource>)
        .collect();
    session
        .start_producers(sources)
        .await
        .expect("producers should start");

    tokio::time::timeout(Duration::from_secs(5), session.wait_idle())
        .await
        .expect("producers should drain their sources");
    let summary = session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!summary.forced);
    assert_eq!(summary.units.len(), 3);
    for unit in &summary.units {
        match &unit.result {
            UnitResult::Producer(report) => {
                assert_eq!(report.sent, 4);
                assert_eq!(report.acked, 4);
                assert_eq!(report.outcome, ProducerOutcome::SourceExhausted);
            }
            other => panic!("unexpected unit result for {}: {other:?}", unit.category),
        }
    }

    let mut per_category: HashMap<Category, Vec<PayloadFrame>> = HashMap::new();
    for _ in 0..12 {
        let frame = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .expect("consumer should see every payload")
            .expect("broadcast should stay open");
        per_category.entry(frame.category()).or_default().push(frame);
    }
    for category in Category::ALL {
        let frames = &per_category[&category];
        assert_eq!(frames.len(), 4);
        assert!(
            frames.windows(2).all(|pair| pair[0].timestamp() < pair[1].timestamp()),
            "{category} payloads should arrive in send order"
        );
    }

    shutdown.cancel();
    let listener = server.await.expect("serve task should not panic");
    assert_eq!(listener.accepted, 1);
    assert_eq!(listener.completed, 1);
    assert_eq!(listener.abandoned, 0);
}

#[tokio::test]
async fn stopping_mid_stream_reports_stopped_producers() {
    let (addr, shutdown, server) = start_listener(HandlerRegistry::default()).await;

    let connection = connect(&addr, &[Category::Pose, Category::Image])
        .await
        .expect("client should connect");
    let session = BridgeSession::new(connection, fast_session());
    session
        .start_producers(vec![
            Box::new(SampleSource::new(Category::Pose)),
            Box::new(SampleSource::new(Category::Image)),
        ])
        .await
        .expect("producers should start");
    assert!(session.is_active(Category::Pose));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = tokio::time::timeout(Duration::from_secs(5), session.stop())
        .await
        .expect("stop should finish within the grace period");

    assert!(!summary.forced);
    assert!(summary.units.iter().all(|unit| !unit.is_failure()));
    assert!(!session.is_active(Category::Pose));
    for unit in &summary.units {
        let UnitResult::Producer(report) = &unit.result else {
            panic!("expected producer result, got {:?}", unit.result);
        };
        assert!(report.sent > 0);
        assert_eq!(report.outcome, ProducerOutcome::Stopped);
    }

    shutdown.cancel();
    server.await.expect("serve task should not panic");
}
