//! Broker client traits.
//!
//! The transport never talks to a broker directly. It goes through these
//! seams, which a concrete client library (or the in-memory broker) implements.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::message::{BrokerMessage, ReceivedMessage};
use crate::transaction::Transaction;

/// How a receiver settles messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Messages are locked on receipt and must be completed, abandoned, or
    /// dead-lettered.
    #[default]
    PeekLock,
    /// Messages are deleted on receipt. No lock and no dead-letter queue.
    ReceiveAndDelete,
}

/// Options used when opening a receiver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReceiverOptions {
    pub receive_mode: ReceiveMode,
    pub prefetch_count: u32,
}

/// A connection to the broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Stable identifier for this connection, used to key cached senders.
    fn identifier(&self) -> &str;

    /// Create a sender bound to a queue or topic.
    async fn create_sender(&self, destination: &str) -> Result<Arc<dyn BrokerSender>, BrokerError>;

    /// Open a pull receiver on a queue or subscription.
    async fn create_receiver(
        &self,
        entity_path: &str,
        options: ReceiverOptions,
    ) -> Result<Arc<dyn MessageReceiver>, BrokerError>;
}

/// A size-bounded set of messages sent in one network call.
pub trait MessageBatch: Send {
    /// Try to add a message. Returns `false` when the batch cannot take it.
    fn try_add(&mut self, message: &BrokerMessage) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_messages(self: Box<Self>) -> Vec<BrokerMessage>;
}

/// Send capability bound to one destination. Safe for concurrent use.
#[async_trait]
pub trait BrokerSender: Send + Sync {
    fn destination(&self) -> &str;

    /// Create an empty batch sized to the broker's limits.
    async fn create_batch(&self) -> Result<Box<dyn MessageBatch>, BrokerError>;

    async fn send_batch(
        &self,
        batch: Box<dyn MessageBatch>,
        transaction: Option<&Transaction>,
    ) -> Result<(), BrokerError>;

    async fn send_message(
        &self,
        message: BrokerMessage,
        transaction: Option<&Transaction>,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Pull-style receiver on one queue or subscription.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Wait up to `max_wait` for the next message.
    async fn receive(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>, BrokerError>;

    async fn complete(
        &self,
        message: &ReceivedMessage,
        transaction: Option<&Transaction>,
    ) -> Result<(), BrokerError>;

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError>;

    /// Change how many messages the receiver buffers ahead of processing.
    fn set_prefetch_count(&self, prefetch_count: u32);

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Provisioning operations used by subscription managers.
#[async_trait]
pub trait AdministrationClient: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError>;

    async fn create_topic(&self, topic: &str) -> Result<(), BrokerError>;

    /// Create a subscription that forwards to `forward_to`. Creating an
    /// existing subscription succeeds.
    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        forward_to: &str,
    ) -> Result<(), BrokerError>;

    async fn delete_subscription(&self, topic: &str, subscription: &str)
        -> Result<(), BrokerError>;

    async fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
        filter: &str,
    ) -> Result<(), BrokerError>;

    async fn delete_rule(&self, topic: &str, subscription: &str, rule: &str)
        -> Result<(), BrokerError>;
}
