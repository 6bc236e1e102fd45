//! Helpers shared by the dispatcher tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use servicebus_transport::client::{InMemoryBroker, SendRecord};
use servicebus_transport::routing::DestinationRouter;
use servicebus_transport::topology::{TopicPerEventOptions, Topology};
use servicebus_transport::{MessageDispatcher, OutgoingMessage, OutgoingOperation};

pub fn dispatcher(broker: &InMemoryBroker) -> MessageDispatcher {
    dispatcher_with_topology(broker, TopicPerEventOptions::new())
}

pub fn dispatcher_with_topology(
    broker: &InMemoryBroker,
    options: TopicPerEventOptions,
) -> MessageDispatcher {
    let router = DestinationRouter::new(Arc::new(Topology::topic_per_event(options)));
    MessageDispatcher::new(Arc::new(broker.clone()), router)
}

pub fn send(id: impl Into<String>, destination: &str) -> OutgoingOperation {
    OutgoingOperation::unicast(OutgoingMessage::new(id, b"{}".to_vec()), destination)
}

pub fn publish(id: impl Into<String>, event_type: &str) -> OutgoingOperation {
    OutgoingOperation::multicast(OutgoingMessage::new(id, b"{}".to_vec()), event_type)
}

/// `count` unicast operations to `destination`, ids `m0..`.
pub fn sends(count: usize, destination: &str) -> Vec<OutgoingOperation> {
    (0..count).map(|i| send(format!("m{}", i), destination)).collect()
}

pub fn batched(records: &[SendRecord]) -> Vec<&SendRecord> {
    records.iter().filter(|r| r.batched).collect()
}

pub fn individual(records: &[SendRecord]) -> Vec<&SendRecord> {
    records.iter().filter(|r| !r.batched).collect()
}

/// Every message id sent, asserting none was sent twice.
pub fn sent_once(records: &[SendRecord]) -> HashSet<String> {
    let mut seen = HashSet::new();
    for id in records.iter().flat_map(|r| r.message_ids.iter()) {
        assert!(seen.insert(id.clone()), "message {} was sent twice", id);
    }
    seen
}
