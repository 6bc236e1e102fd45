//! Routing failures and broker send failures.

use servicebus_transport::client::InMemoryBroker;
use servicebus_transport::topology::TopicPerEventOptions;
use servicebus_transport::{BrokerError, DispatchError};

use crate::support::{dispatcher, dispatcher_with_topology, publish, send, sends};

// ============================================================================
// Test 1: A missing topic means zero subscribers
// ============================================================================

#[tokio::test]
async fn publish_to_missing_topic_succeeds() {
    let broker = InMemoryBroker::new();
    broker.remove_entity("OrderPlaced");
    let dispatcher = dispatcher(&broker);

    dispatcher
        .dispatch(&[publish("e1", "OrderPlaced"), send("m1", "billing")], None)
        .await
        .unwrap();

    assert!(broker.delivered("OrderPlaced").is_empty());
    assert_eq!(broker.delivered("billing").len(), 1);
}

// ============================================================================
// Test 2: A missing queue is an error
// ============================================================================

#[tokio::test]
async fn send_to_missing_queue_fails() {
    let broker = InMemoryBroker::new();
    broker.remove_entity("ghost");
    let dispatcher = dispatcher(&broker);

    let err = dispatcher
        .dispatch(&[send("m1", "ghost")], None)
        .await
        .unwrap_err();

    match err {
        DispatchError::Send { destination, source } => {
            assert_eq!(destination, "ghost");
            assert!(source.is_entity_not_found());
        }
        other => panic!("unexpected error: {}", other),
    }
}

// ============================================================================
// Test 3: Connectivity failures propagate, siblings still go out
// ============================================================================

#[tokio::test]
async fn connectivity_failure_does_not_stop_other_destinations() {
    let broker = InMemoryBroker::new();
    broker.fail_sends_to("billing", BrokerError::Communication("socket closed".into()));
    let dispatcher = dispatcher(&broker);

    let mut operations = sends(3, "sales");
    operations.push(send("b1", "billing"));
    let err = dispatcher.dispatch(&operations, None).await.unwrap_err();

    assert!(err.broker_error().is_some_and(BrokerError::is_connectivity));
    assert_eq!(broker.delivered("sales").len(), 3);
    assert!(broker.delivered("billing").is_empty());
}

// ============================================================================
// Test 4: Unmapped events fail before anything is sent
// ============================================================================

#[tokio::test]
async fn unmapped_event_fails_fast() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher_with_topology(
        &broker,
        TopicPerEventOptions::new()
            .publish("OrderPlaced", "sales")
            .throw_if_unmapped(),
    );

    let err = dispatcher
        .dispatch(&[send("m1", "billing"), publish("e1", "OrderShipped")], None)
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::UnroutableEvent(ref name) if name == "OrderShipped"));
    assert!(broker.senders_created().is_empty());
    assert!(broker.sends().is_empty());
}

// ============================================================================
// Test 5: An event fans out to every mapped topic
// ============================================================================

#[tokio::test]
async fn event_is_published_to_every_mapped_topic() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher_with_topology(
        &broker,
        TopicPerEventOptions::new()
            .publish("OrderPlaced", "sales")
            .publish("OrderPlaced", "audit"),
    );

    dispatcher
        .dispatch(&[publish("e1", "OrderPlaced")], None)
        .await
        .unwrap();

    assert_eq!(broker.delivered("sales").len(), 1);
    assert_eq!(broker.delivered("audit").len(), 1);
}

// ============================================================================
// Test 6: Close reports every failing sender
// ============================================================================

#[tokio::test]
async fn close_aggregates_sender_failures() {
    let broker = InMemoryBroker::new();
    broker.fail_close_for("billing", BrokerError::ServiceTimeout("slow".into()));
    let dispatcher = dispatcher(&broker);

    dispatcher
        .dispatch(&[send("m1", "billing"), send("m2", "sales")], None)
        .await
        .unwrap();

    let err = dispatcher.close().await.unwrap_err();
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].0, "billing");
    assert_eq!(broker.closed_senders(), vec!["sales"]);
}
