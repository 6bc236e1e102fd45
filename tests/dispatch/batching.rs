//! Packing operations into batches.

use std::collections::HashSet;

use servicebus_transport::client::InMemoryBroker;
use servicebus_transport::message::headers;
use servicebus_transport::{OutgoingMessage, OutgoingOperation};

use crate::support::{batched, dispatcher, individual, send, sends, sent_once};

// ============================================================================
// Test 1: Full batches, then the remainder
// ============================================================================

#[tokio::test]
async fn two_hundred_messages_make_two_batches() {
    let broker = InMemoryBroker::new().with_batch_limits(Some(150), None);
    let dispatcher = dispatcher(&broker);

    dispatcher.dispatch(&sends(200, "orders"), None).await.unwrap();

    let records = broker.sends();
    let sizes: Vec<usize> = batched(&records).iter().map(|r| r.message_ids.len()).collect();
    assert_eq!(sizes, vec![150, 50]);
    assert!(individual(&records).is_empty());
    assert_eq!(records[0].message_ids[0], "m0");
    assert_eq!(records[1].message_ids[0], "m150");
}

// ============================================================================
// Test 2: Every add refused means every message goes alone
// ============================================================================

#[tokio::test]
async fn messages_no_batch_accepts_are_sent_individually() {
    let broker = InMemoryBroker::new().with_batch_limits(None, Some(1));
    let dispatcher = dispatcher(&broker);

    dispatcher.dispatch(&sends(5, "orders"), None).await.unwrap();

    let records = broker.sends();
    assert!(batched(&records).is_empty());
    assert_eq!(individual(&records).len(), 5);
    assert_eq!(sent_once(&records).len(), 5);
}

// ============================================================================
// Test 3: Oversized message goes alone, after the batches
// ============================================================================

#[tokio::test]
async fn oversized_message_is_sent_once_after_batches() {
    let broker = InMemoryBroker::new().with_batch_limits(None, Some(64));
    let dispatcher = dispatcher(&broker);

    let mut operations = sends(4, "orders");
    operations.insert(
        2,
        OutgoingOperation::unicast(OutgoingMessage::new("big", vec![0; 512]), "orders"),
    );
    dispatcher.dispatch(&operations, None).await.unwrap();

    let records = broker.sends();
    let singles = individual(&records);
    assert_eq!(singles.len(), 1);
    assert_eq!(singles[0].message_ids, vec!["big"]);
    assert!(batched(&records)
        .iter()
        .all(|r| !r.message_ids.contains(&"big".to_string())));
    assert_eq!(records.last().unwrap().message_ids, vec!["big"]);
    assert_eq!(sent_once(&records).len(), 5);
}

// ============================================================================
// Test 4: Packing loses and duplicates nothing
// ============================================================================

#[tokio::test]
async fn every_message_is_sent_exactly_once() {
    let broker = InMemoryBroker::new().with_batch_limits(Some(7), Some(200));
    let dispatcher = dispatcher(&broker);

    let operations: Vec<OutgoingOperation> = (0..53)
        .map(|i| {
            let size = (i * 37) % 260;
            OutgoingOperation::unicast(OutgoingMessage::new(format!("m{}", i), vec![1; size]), "orders")
        })
        .collect();
    dispatcher.dispatch(&operations, None).await.unwrap();

    let expected: HashSet<String> = (0..53).map(|i| format!("m{}", i)).collect();
    let records = broker.sends();
    assert_eq!(sent_once(&records), expected);
    assert!(records.iter().all(|r| !r.message_ids.is_empty()));
}

// ============================================================================
// Test 5: Batches never mix destinations
// ============================================================================

#[tokio::test]
async fn batches_are_partitioned_by_destination() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher(&broker);

    let operations = vec![
        send("a1", "sales"),
        send("b1", "billing"),
        send("a2", "sales"),
        send("b2", "billing").isolated(),
        send("a3", "sales"),
    ];
    dispatcher.dispatch(&operations, None).await.unwrap();

    for record in broker.sends() {
        let prefix = if record.destination == "sales" { 'a' } else { 'b' };
        assert!(record.message_ids.iter().all(|id| id.starts_with(prefix)));
    }
    let sales: Vec<String> = broker.delivered("sales").into_iter().map(|m| m.message_id).collect();
    assert_eq!(sales, vec!["a1", "a2", "a3"]);
}

// ============================================================================
// Test 6: Isolated operations are never batched
// ============================================================================

#[tokio::test]
async fn isolated_operations_are_sent_alone() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher(&broker);

    let operations = vec![
        send("i1", "orders").isolated(),
        send("d1", "orders"),
        send("i2", "orders").isolated(),
        send("d2", "orders"),
        send("i3", "orders").isolated(),
    ];
    dispatcher.dispatch(&operations, None).await.unwrap();

    let records = broker.sends();
    let singles: HashSet<String> = individual(&records)
        .iter()
        .flat_map(|r| r.message_ids.clone())
        .collect();
    let expected: HashSet<String> = ["i1", "i2", "i3"].iter().map(|s| s.to_string()).collect();
    assert_eq!(singles, expected);

    let batches = batched(&records);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].message_ids, vec!["d1", "d2"]);
}

// ============================================================================
// Test 7: Native fields and the customizer
// ============================================================================

#[tokio::test]
async fn headers_and_customizer_shape_the_native_message() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher(&broker);

    let operation = OutgoingOperation::unicast(
        OutgoingMessage::new("m1", b"{}".to_vec())
            .with_header(headers::CORRELATION_ID, "c-1")
            .with_header(headers::CONTENT_TYPE, "application/json"),
        "orders@host-7",
    )
    .with_customizer(|message| message.subject = Some("priority".into()));
    dispatcher.dispatch(&[operation], None).await.unwrap();

    let delivered = broker.delivered("orders");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].correlation_id.as_deref(), Some("c-1"));
    assert_eq!(delivered[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(delivered[0].subject.as_deref(), Some("priority"));
}

// ============================================================================
// Test 8: Senders are created once and closed on shutdown
// ============================================================================

#[tokio::test]
async fn senders_are_reused_and_closed() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher(&broker);

    dispatcher.dispatch(&sends(3, "orders"), None).await.unwrap();
    dispatcher.dispatch(&[send("x", "orders").isolated()], None).await.unwrap();
    dispatcher.dispatch(&[send("y", "billing")], None).await.unwrap();

    assert_eq!(broker.senders_created(), vec!["orders", "billing"]);

    dispatcher.close().await.unwrap();
    let mut closed = broker.closed_senders();
    closed.sort();
    assert_eq!(closed, vec!["billing", "orders"]);
}
