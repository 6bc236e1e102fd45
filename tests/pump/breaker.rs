//! Persistent receive failures throttle the pump and raise a critical error.

use std::time::Duration;

use servicebus_transport::client::InMemoryBroker;
use servicebus_transport::BrokerError;

use crate::support::{
    settings, start_pump, RecordingCritical, RecordingHandler, ScriptedErrorHandler, INPUT,
};

// ============================================================================
// Test 1: Throttle after two minutes of failures, recover afterwards
// ============================================================================

#[tokio::test(start_paused = true)]
async fn persistent_receive_failures_throttle_then_recover() {
    let broker = InMemoryBroker::new();
    let critical = RecordingCritical::new();
    let pump = start_pump(
        &broker,
        settings()
            .with_max_concurrency(4)
            .with_receive_wait(Duration::from_secs(5)),
        RecordingHandler::succeeding(),
        ScriptedErrorHandler::retry(),
        critical.clone(),
    )
    .await;
    assert_eq!(broker.prefetch_count(INPUT), Some(40));

    // Four workers fail about once a second each; one after throttling.
    broker.fail_next_receives(600, BrokerError::Communication("connection reset".into()));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(critical.raised().is_empty());
    assert_eq!(broker.prefetch_count(INPUT), Some(40));

    tokio::time::sleep(Duration::from_secs(70)).await;
    let raised = critical.raised();
    assert_eq!(raised.len(), 1);
    assert!(raised[0].contains(INPUT));
    assert_eq!(broker.prefetch_count(INPUT), Some(10));

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(broker.prefetch_count(INPUT), Some(40));
    assert_eq!(critical.raised().len(), 1);

    pump.stop_receive().await.unwrap();
}

// ============================================================================
// Test 2: Short outages never trip the breaker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn short_outage_does_not_trigger() {
    let broker = InMemoryBroker::new();
    let critical = RecordingCritical::new();
    let pump = start_pump(
        &broker,
        settings().with_max_concurrency(2),
        RecordingHandler::succeeding(),
        ScriptedErrorHandler::retry(),
        critical.clone(),
    )
    .await;

    broker.fail_next_receives(20, BrokerError::ServiceBusy("throttled".into()));
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert!(critical.raised().is_empty());
    assert_eq!(broker.prefetch_count(INPUT), Some(20));
    pump.stop_receive().await.unwrap();
}
