//! Dispatch inside an ambient transaction.

use std::collections::HashSet;
use std::sync::Arc;

use servicebus_transport::client::InMemoryBroker;
use servicebus_transport::topology::TopicPerEventOptions;
use servicebus_transport::{
    BrokerError, DispatchError, Transaction, TransactionBinding, TransactionError,
};

use crate::support::{dispatcher, dispatcher_with_topology, publish, send, sends};

fn bind(broker: &InMemoryBroker, partition_key: Option<&str>) -> (Transaction, TransactionBinding) {
    let txn = Transaction::new(partition_key.map(str::to_string));
    let binding = TransactionBinding::transactional(txn.clone(), Arc::new(broker.clone()));
    (txn, binding)
}

// ============================================================================
// Test 1: Over the per-transaction limit fails before any sender exists
// ============================================================================

#[tokio::test]
async fn too_many_messages_in_a_transaction_fails_fast() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher(&broker);
    let (_txn, binding) = bind(&broker, None);

    let err = dispatcher
        .dispatch(&sends(101, "orders"), Some(&binding))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::TransactionLimitExceeded { count: 101, limit: 100 }
    ));
    assert!(broker.senders_created().is_empty());
}

// ============================================================================
// Test 2: At the limit, sends are staged until commit
// ============================================================================

#[tokio::test]
async fn transactional_sends_appear_on_commit() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher(&broker);
    let (txn, binding) = bind(&broker, Some("p-1"));

    dispatcher
        .dispatch(&sends(100, "orders"), Some(&binding))
        .await
        .unwrap();
    assert!(broker.sends().is_empty());

    txn.commit().unwrap();

    let records = broker.sends();
    assert!(records
        .iter()
        .all(|r| r.transaction_id.as_deref() == Some(txn.id())));
    let delivered = broker.delivered("orders");
    assert_eq!(delivered.len(), 100);
    assert!(delivered.iter().all(|m| {
        m.partition_key.as_deref() == Some("p-1")
            && m.transaction_partition_key.as_deref() == Some("p-1")
    }));
}

// ============================================================================
// Test 3: The limit only applies inside a transaction
// ============================================================================

#[tokio::test]
async fn limit_is_ignored_without_a_transaction() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher(&broker);

    dispatcher.dispatch(&sends(250, "orders"), None).await.unwrap();
    assert_eq!(broker.delivered("orders").len(), 250);
}

// ============================================================================
// Test 4: Fan-out counts once per destination
// ============================================================================

#[tokio::test]
async fn fan_out_counts_toward_the_limit() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher_with_topology(
        &broker,
        TopicPerEventOptions::new()
            .publish("OrderPlaced", "sales")
            .publish("OrderPlaced", "audit"),
    );
    let (_txn, binding) = bind(&broker, None);

    let events: Vec<_> = (0..60).map(|i| publish(format!("e{}", i), "OrderPlaced")).collect();
    let err = dispatcher.dispatch(&events, Some(&binding)).await.unwrap_err();

    assert!(matches!(
        err,
        DispatchError::TransactionLimitExceeded { count: 120, .. }
    ));
}

// ============================================================================
// Test 5: Isolated sends escape the transaction
// ============================================================================

#[tokio::test]
async fn isolated_sends_are_immediate_and_untransacted() {
    let broker = InMemoryBroker::new();
    let dispatcher = dispatcher(&broker);
    let (txn, binding) = bind(&broker, Some("p-1"));

    dispatcher
        .dispatch(
            &[send("audit-1", "audit").isolated(), send("m1", "orders")],
            Some(&binding),
        )
        .await
        .unwrap();

    let before_commit = broker.sends();
    assert_eq!(before_commit.len(), 1);
    assert_eq!(before_commit[0].message_ids, vec!["audit-1"]);
    assert!(!before_commit[0].batched);
    assert!(before_commit[0].transaction_id.is_none());

    let audit = broker.delivered("audit");
    assert_eq!(audit[0].partition_key.as_deref(), Some("p-1"));
    assert!(audit[0].transaction_partition_key.is_none());

    txn.commit().unwrap();
    let ids: HashSet<String> = broker
        .sends()
        .into_iter()
        .flat_map(|r| r.message_ids)
        .collect();
    assert!(ids.contains("m1"));
}

// ============================================================================
// Test 6: A failed send dooms the transaction
// ============================================================================

#[tokio::test]
async fn failed_send_dooms_the_transaction() {
    let broker = InMemoryBroker::new();
    broker.fail_sends_to("billing", BrokerError::ServiceBusy("throttled".into()));
    let dispatcher = dispatcher(&broker);
    let (txn, binding) = bind(&broker, None);

    let result = dispatcher
        .dispatch(&[send("s1", "sales"), send("b1", "billing")], Some(&binding))
        .await;
    assert!(result.is_err());
    assert!(txn.is_doomed());

    assert!(matches!(txn.commit(), Err(TransactionError::Doomed(_))));
    assert!(broker.sends().is_empty());
}

// ============================================================================
// Test 7: A missing topic does not doom the transaction
// ============================================================================

#[tokio::test]
async fn missing_topic_keeps_the_transaction_alive() {
    let broker = InMemoryBroker::new();
    broker.remove_entity("OrderPlaced");
    let dispatcher = dispatcher(&broker);
    let (txn, binding) = bind(&broker, None);

    dispatcher
        .dispatch(&[publish("e1", "OrderPlaced"), send("m1", "orders")], Some(&binding))
        .await
        .unwrap();

    txn.commit().unwrap();
    assert_eq!(broker.delivered("orders").len(), 1);
}
