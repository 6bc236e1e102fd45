//! How the pump settles each received message.

use std::time::SystemTime;

use servicebus_transport::client::{InMemoryBroker, Settlement};
use servicebus_transport::message::ReceivedMessage;
use servicebus_transport::{BrokerError, HandlerError};

use crate::support::{
    eventually, settings, start_pump, RecordingCritical, RecordingHandler, ScriptedErrorHandler,
    INPUT,
};

fn message(id: &str) -> ReceivedMessage {
    ReceivedMessage::new(id, b"{}".to_vec())
}

// ============================================================================
// Test 1: Successful messages are completed
// ============================================================================

#[tokio::test]
async fn handled_messages_are_completed() {
    let broker = InMemoryBroker::new();
    let handler = RecordingHandler::succeeding();
    let pump = start_pump(
        &broker,
        settings(),
        handler.clone(),
        ScriptedErrorHandler::retry(),
        RecordingCritical::new(),
    )
    .await;

    for id in ["m1", "m2", "m3"] {
        broker.enqueue(INPUT, message(id).with_property("Region", "emea"));
    }
    eventually("three completions", || broker.completed().len() == 3).await;
    pump.stop_receive().await.unwrap();

    let mut seen = handler.seen();
    seen.sort();
    assert_eq!(seen, vec!["m1", "m2", "m3"]);
    assert!(broker.abandoned().is_empty());
}

// ============================================================================
// Test 2: Expired locks are abandoned without running the handler
// ============================================================================

#[tokio::test]
async fn expired_lock_is_abandoned() {
    let broker = InMemoryBroker::new();
    let handler = RecordingHandler::succeeding();
    let pump = start_pump(
        &broker,
        settings(),
        handler.clone(),
        ScriptedErrorHandler::retry(),
        RecordingCritical::new(),
    )
    .await;

    broker.enqueue(INPUT, message("m1").with_locked_until(SystemTime::UNIX_EPOCH));
    eventually("abandon", || broker.abandoned() == vec!["m1"]).await;
    pump.stop_receive().await.unwrap();

    assert!(handler.seen().is_empty());
    assert!(broker.completed().is_empty());
}

// ============================================================================
// Test 3: Poison messages go to the dead-letter queue
// ============================================================================

#[tokio::test]
async fn message_without_id_is_dead_lettered() {
    let broker = InMemoryBroker::new();
    let handler = RecordingHandler::succeeding();
    let pump = start_pump(
        &broker,
        settings(),
        handler.clone(),
        ScriptedErrorHandler::retry(),
        RecordingCritical::new(),
    )
    .await;

    let mut anonymous = message("ignored");
    anonymous.message_id = None;
    broker.enqueue(INPUT, anonymous);
    eventually("dead-letter", || broker.dead_lettered().len() == 1).await;
    pump.stop_receive().await.unwrap();

    let settlements = broker.settlements();
    assert!(matches!(
        &settlements[0].settlement,
        Settlement::DeadLettered { reason, .. } if reason == "Missing message id"
    ));
    assert!(handler.seen().is_empty());
}

#[tokio::test]
async fn unreadable_properties_are_dead_lettered() {
    let broker = InMemoryBroker::new();
    let handler = RecordingHandler::succeeding();
    let pump = start_pump(
        &broker,
        settings(),
        handler.clone(),
        ScriptedErrorHandler::retry(),
        RecordingCritical::new(),
    )
    .await;

    broker.enqueue(
        INPUT,
        message("m1").with_property("Tags", serde_json::json!(["a", "b"])),
    );
    eventually("dead-letter", || broker.dead_lettered() == vec!["m1"]).await;
    pump.stop_receive().await.unwrap();

    assert!(matches!(
        &broker.settlements()[0].settlement,
        Settlement::DeadLettered { reason, .. } if reason == "Unreadable message"
    ));
    assert!(handler.seen().is_empty());
}

// ============================================================================
// Test 4: The error callback decides between complete and abandon
// ============================================================================

#[tokio::test]
async fn handled_failure_is_completed() {
    let broker = InMemoryBroker::new();
    let on_error = ScriptedErrorHandler::handled();
    let pump = start_pump(
        &broker,
        settings(),
        RecordingHandler::failing(),
        on_error.clone(),
        RecordingCritical::new(),
    )
    .await;

    broker.enqueue(INPUT, message("m1"));
    eventually("completion", || broker.completed() == vec!["m1"]).await;
    pump.stop_receive().await.unwrap();

    assert_eq!(on_error.seen(), vec!["m1"]);
    assert!(broker.abandoned().is_empty());
}

#[tokio::test]
async fn retry_required_abandons() {
    let broker = InMemoryBroker::new();
    let pump = start_pump(
        &broker,
        settings(),
        RecordingHandler::failing(),
        ScriptedErrorHandler::retry(),
        RecordingCritical::new(),
    )
    .await;

    broker.enqueue(INPUT, message("m1"));
    eventually("abandon", || broker.abandoned() == vec!["m1"]).await;
    pump.stop_receive().await.unwrap();

    assert!(broker.completed().is_empty());
}

// ============================================================================
// Test 5: A failing error callback
// ============================================================================

#[tokio::test]
async fn error_handler_failure_raises_critical_error() {
    let broker = InMemoryBroker::new();
    let critical = RecordingCritical::new();
    let pump = start_pump(
        &broker,
        settings(),
        RecordingHandler::failing(),
        ScriptedErrorHandler::new(|| Err(HandlerError::Failed("policy crashed".into()))),
        critical.clone(),
    )
    .await;

    broker.enqueue(INPUT, message("m1"));
    eventually("abandon", || broker.abandoned() == vec!["m1"]).await;
    pump.stop_receive().await.unwrap();

    let raised = critical.raised();
    assert_eq!(raised.len(), 1);
    assert!(raised[0].contains("native id 'm1'"));
}

#[tokio::test]
async fn transient_error_handler_failure_only_abandons() {
    let broker = InMemoryBroker::new();
    let critical = RecordingCritical::new();
    let pump = start_pump(
        &broker,
        settings(),
        RecordingHandler::failing(),
        ScriptedErrorHandler::new(|| {
            Err(HandlerError::Broker(BrokerError::ServiceBusy("throttled".into())))
        }),
        critical.clone(),
    )
    .await;

    broker.enqueue(INPUT, message("m1"));
    eventually("abandon", || broker.abandoned() == vec!["m1"]).await;
    pump.stop_receive().await.unwrap();

    assert!(critical.raised().is_empty());
}

#[tokio::test]
async fn lost_lock_while_abandoning_is_ignored() {
    let broker = InMemoryBroker::new();
    let on_error = ScriptedErrorHandler::retry();
    let critical = RecordingCritical::new();
    let pump = start_pump(
        &broker,
        settings().with_max_concurrency(1),
        RecordingHandler::failing(),
        on_error.clone(),
        critical.clone(),
    )
    .await;

    broker.fail_next_abandon(BrokerError::MessageLockLost("m1".into()));
    broker.enqueue(INPUT, message("m1"));
    broker.enqueue(INPUT, message("m2"));
    eventually("m2 abandon", || broker.abandoned() == vec!["m2"]).await;
    pump.stop_receive().await.unwrap();

    assert_eq!(on_error.seen(), vec!["m1", "m2"]);
    assert!(critical.raised().is_empty());
    assert!(broker.completed().is_empty());
}

// ============================================================================
// Test 6: Handler failures never trip the circuit breaker
// ============================================================================

#[tokio::test]
async fn handler_failures_do_not_throttle_receiving() {
    let broker = InMemoryBroker::new();
    let critical = RecordingCritical::new();
    let pump = start_pump(
        &broker,
        settings(),
        RecordingHandler::failing(),
        ScriptedErrorHandler::retry(),
        critical.clone(),
    )
    .await;

    for i in 0..20 {
        broker.enqueue(INPUT, message(&format!("m{}", i)));
    }
    eventually("twenty abandons", || broker.abandoned().len() == 20).await;
    pump.stop_receive().await.unwrap();

    assert!(critical.raised().is_empty());
    assert_eq!(broker.prefetch_count(INPUT), Some(20));
}
