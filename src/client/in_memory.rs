//! In-memory broker for testing and single-process scenarios.
//!
//! Implements every client seam against shared in-process state:
//! - senders with size-bounded batches and transactional staging
//! - peek-lock and receive-and-delete receivers over per-entity inboxes
//! - provisioning of topics, subscriptions, and rules
//! - failure injection and recording of every send and settlement

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::client::{
    AdministrationClient, BrokerClient, BrokerSender, MessageBatch, MessageReceiver,
    ReceiveMode, ReceiverOptions,
};
use crate::error::BrokerError;
use crate::message::{BrokerMessage, ReceivedMessage};
use crate::transaction::{Enlistment, Transaction};

const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);

/// One network call made by a sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendRecord {
    pub destination: String,
    pub message_ids: Vec<String>,
    /// `true` for `send_batch`, `false` for `send_message`
    pub batched: bool,
    pub transaction_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Abandoned,
    DeadLettered { reason: String, description: String },
}

/// One terminal acknowledgment made by a receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementRecord {
    pub entity: String,
    pub message_id: Option<String>,
    pub settlement: Settlement,
    pub transaction_id: Option<String>,
}

#[derive(Default)]
struct BrokerState {
    max_batch_messages: Option<usize>,
    max_batch_bytes: Option<usize>,
    max_message_bytes: Option<usize>,
    sender_creation_delay: Option<Duration>,
    missing_entities: HashSet<String>,
    send_failures: HashMap<String, BrokerError>,
    close_failures: HashMap<String, BrokerError>,
    receive_failures: VecDeque<BrokerError>,
    complete_failures: VecDeque<BrokerError>,
    abandon_failures: VecDeque<BrokerError>,
    senders_created: Vec<String>,
    closed_senders: Vec<String>,
    sends: Vec<SendRecord>,
    delivered: HashMap<String, Vec<BrokerMessage>>,
    inboxes: HashMap<String, VecDeque<ReceivedMessage>>,
    settlements: Vec<SettlementRecord>,
    prefetch_counts: HashMap<String, u32>,
    closed_receivers: Vec<String>,
    topics: HashSet<String>,
    subscriptions: HashMap<(String, String), String>,
    rules: HashMap<(String, String), Vec<(String, String)>>,
}

struct Shared {
    identifier: String,
    state: Mutex<BrokerState>,
    /// Wakes receivers when a message or an injected failure arrives
    arrivals: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_send(&self, record: SendRecord, messages: Vec<BrokerMessage>) {
        let mut state = self.state();
        state
            .delivered
            .entry(record.destination.clone())
            .or_default()
            .extend(messages);
        state.sends.push(record);
    }

    fn apply_settlement(&self, record: SettlementRecord) {
        self.state().settlements.push(record);
    }
}

/// In-memory broker.
///
/// Cloning produces another handle to the same broker state, so a test can
/// hand one clone to the transport and inspect another.
///
/// ## Example
///
/// ```
/// use servicebus_transport::client::InMemoryBroker;
///
/// let broker = InMemoryBroker::new().with_batch_limits(Some(100), None);
/// assert!(broker.sends().is_empty());
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_identifier("in-memory")
    }

    /// Create a broker whose connection reports the given identifier.
    pub fn with_identifier(identifier: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                identifier: identifier.into(),
                state: Mutex::new(BrokerState::default()),
                arrivals: Notify::new(),
            }),
        }
    }

    /// Bound every batch by message count and/or total bytes.
    pub fn with_batch_limits(self, max_messages: Option<usize>, max_bytes: Option<usize>) -> Self {
        {
            let mut state = self.shared.state();
            state.max_batch_messages = max_messages;
            state.max_batch_bytes = max_bytes;
        }
        self
    }

    /// Reject individual sends larger than `max_bytes`.
    pub fn with_max_message_bytes(self, max_bytes: usize) -> Self {
        self.shared.state().max_message_bytes = Some(max_bytes);
        self
    }

    /// Delay sender creation, widening the window for concurrent first use.
    pub fn with_sender_creation_delay(self, delay: Duration) -> Self {
        self.shared.state().sender_creation_delay = Some(delay);
        self
    }

    /// Make sends to `entity` fail with `EntityNotFound`.
    pub fn remove_entity(&self, entity: impl Into<String>) {
        self.shared.state().missing_entities.insert(entity.into());
    }

    /// Make every send to `destination` fail with `error`.
    pub fn fail_sends_to(&self, destination: impl Into<String>, error: BrokerError) {
        self.shared
            .state()
            .send_failures
            .insert(destination.into(), error);
    }

    pub fn fail_close_for(&self, destination: impl Into<String>, error: BrokerError) {
        self.shared
            .state()
            .close_failures
            .insert(destination.into(), error);
    }

    /// Make the next `count` receive calls fail with `error`.
    pub fn fail_next_receives(&self, count: usize, error: BrokerError) {
        {
            let mut state = self.shared.state();
            for _ in 0..count {
                state.receive_failures.push_back(error.clone());
            }
        }
        self.shared.arrivals.notify_waiters();
    }

    pub fn fail_next_complete(&self, error: BrokerError) {
        self.shared.state().complete_failures.push_back(error);
    }

    pub fn fail_next_abandon(&self, error: BrokerError) {
        self.shared.state().abandon_failures.push_back(error);
    }

    /// Queue a message for delivery from `entity`.
    pub fn enqueue(&self, entity: impl Into<String>, message: ReceivedMessage) {
        self.shared
            .state()
            .inboxes
            .entry(entity.into())
            .or_default()
            .push_back(message);
        self.shared.arrivals.notify_waiters();
    }

    /// Messages still waiting to be received from `entity`.
    pub fn pending(&self, entity: &str) -> usize {
        self.shared
            .state()
            .inboxes
            .get(entity)
            .map_or(0, VecDeque::len)
    }

    /// Every committed network send, in order.
    pub fn sends(&self) -> Vec<SendRecord> {
        self.shared.state().sends.clone()
    }

    /// Every committed message delivered to `destination`.
    pub fn delivered(&self, destination: &str) -> Vec<BrokerMessage> {
        self.shared
            .state()
            .delivered
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Every committed settlement, in order.
    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.shared.state().settlements.clone()
    }

    pub fn completed(&self) -> Vec<String> {
        self.settled_ids(|s| matches!(s, Settlement::Completed))
    }

    pub fn abandoned(&self) -> Vec<String> {
        self.settled_ids(|s| matches!(s, Settlement::Abandoned))
    }

    pub fn dead_lettered(&self) -> Vec<String> {
        self.settled_ids(|s| matches!(s, Settlement::DeadLettered { .. }))
    }

    fn settled_ids(&self, filter: impl Fn(&Settlement) -> bool) -> Vec<String> {
        self.shared
            .state()
            .settlements
            .iter()
            .filter(|r| filter(&r.settlement))
            .map(|r| r.message_id.clone().unwrap_or_default())
            .collect()
    }

    /// Destinations for which a sender was created, in creation order.
    pub fn senders_created(&self) -> Vec<String> {
        self.shared.state().senders_created.clone()
    }

    pub fn closed_senders(&self) -> Vec<String> {
        self.shared.state().closed_senders.clone()
    }

    pub fn closed_receivers(&self) -> Vec<String> {
        self.shared.state().closed_receivers.clone()
    }

    /// Current prefetch count of the receiver on `entity`.
    pub fn prefetch_count(&self, entity: &str) -> Option<u32> {
        self.shared.state().prefetch_counts.get(entity).copied()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.shared.state().topics.iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Subscriptions on `topic` with their forwarding destination.
    pub fn subscriptions(&self, topic: &str) -> Vec<(String, String)> {
        let mut subs: Vec<_> = self
            .shared
            .state()
            .subscriptions
            .iter()
            .filter(|((t, _), _)| t == topic)
            .map(|((_, s), forward)| (s.clone(), forward.clone()))
            .collect();
        subs.sort();
        subs
    }

    /// Rules on a subscription as `(name, filter)` pairs.
    pub fn rules(&self, topic: &str, subscription: &str) -> Vec<(String, String)> {
        self.shared
            .state()
            .rules
            .get(&(topic.to_string(), subscription.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    async fn create_sender(&self, destination: &str) -> Result<Arc<dyn BrokerSender>, BrokerError> {
        let delay = {
            let mut state = self.shared.state();
            state.senders_created.push(destination.to_string());
            state.sender_creation_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Arc::new(InMemorySender {
            destination: destination.to_string(),
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn create_receiver(
        &self,
        entity_path: &str,
        options: ReceiverOptions,
    ) -> Result<Arc<dyn MessageReceiver>, BrokerError> {
        self.shared
            .state()
            .prefetch_counts
            .insert(entity_path.to_string(), options.prefetch_count);
        Ok(Arc::new(InMemoryReceiver {
            entity: entity_path.to_string(),
            mode: options.receive_mode,
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Batch bounded by the broker's message-count and byte limits.
pub struct InMemoryBatch {
    max_messages: Option<usize>,
    max_bytes: Option<usize>,
    bytes: usize,
    messages: Vec<BrokerMessage>,
}

impl MessageBatch for InMemoryBatch {
    fn try_add(&mut self, message: &BrokerMessage) -> bool {
        if self
            .max_messages
            .is_some_and(|max| self.messages.len() >= max)
        {
            return false;
        }
        let size = message.size_in_bytes();
        if self.max_bytes.is_some_and(|max| self.bytes + size > max) {
            return false;
        }
        self.bytes += size;
        self.messages.push(message.clone());
        true
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn into_messages(self: Box<Self>) -> Vec<BrokerMessage> {
        self.messages
    }
}

struct InMemorySender {
    destination: String,
    shared: Arc<Shared>,
}

impl InMemorySender {
    fn check_destination(&self) -> Result<(), BrokerError> {
        let state = self.shared.state();
        if state.missing_entities.contains(&self.destination) {
            return Err(BrokerError::EntityNotFound(self.destination.clone()));
        }
        if let Some(err) = state.send_failures.get(&self.destination) {
            return Err(err.clone());
        }
        Ok(())
    }

    fn deliver(
        &self,
        messages: Vec<BrokerMessage>,
        batched: bool,
        transaction: Option<&Transaction>,
    ) -> Result<(), BrokerError> {
        let record = SendRecord {
            destination: self.destination.clone(),
            message_ids: messages.iter().map(|m| m.message_id.clone()).collect(),
            batched,
            transaction_id: transaction.map(|t| t.id().to_string()),
        };
        match transaction {
            Some(txn) => txn
                .enlist(Box::new(StagedSend {
                    shared: Arc::clone(&self.shared),
                    staged: Mutex::new(Some((record, messages))),
                }))
                .map_err(|err| BrokerError::Other(err.to_string())),
            None => {
                self.shared.apply_send(record, messages);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl BrokerSender for InMemorySender {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn create_batch(&self) -> Result<Box<dyn MessageBatch>, BrokerError> {
        let state = self.shared.state();
        Ok(Box::new(InMemoryBatch {
            max_messages: state.max_batch_messages,
            max_bytes: state.max_batch_bytes,
            bytes: 0,
            messages: Vec::new(),
        }))
    }

    async fn send_batch(
        &self,
        batch: Box<dyn MessageBatch>,
        transaction: Option<&Transaction>,
    ) -> Result<(), BrokerError> {
        self.check_destination()?;
        self.deliver(batch.into_messages(), true, transaction)
    }

    async fn send_message(
        &self,
        message: BrokerMessage,
        transaction: Option<&Transaction>,
    ) -> Result<(), BrokerError> {
        self.check_destination()?;
        let max = self.shared.state().max_message_bytes;
        if max.is_some_and(|max| message.size_in_bytes() > max) {
            return Err(BrokerError::MessageSizeExceeded(message.message_id));
        }
        self.deliver(vec![message], false, transaction)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        if let Some(err) = state.close_failures.get(&self.destination) {
            return Err(err.clone());
        }
        state.closed_senders.push(self.destination.clone());
        Ok(())
    }
}

struct StagedSend {
    shared: Arc<Shared>,
    staged: Mutex<Option<(SendRecord, Vec<BrokerMessage>)>>,
}

impl Enlistment for StagedSend {
    fn commit(&self) -> Result<(), BrokerError> {
        let staged = self
            .staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((record, messages)) = staged {
            self.shared.apply_send(record, messages);
        }
        Ok(())
    }

    fn rollback(&self) {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

struct StagedSettlement {
    shared: Arc<Shared>,
    staged: Mutex<Option<SettlementRecord>>,
}

impl Enlistment for StagedSettlement {
    fn commit(&self) -> Result<(), BrokerError> {
        let staged = self
            .staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(record) = staged {
            self.shared.apply_settlement(record);
        }
        Ok(())
    }

    fn rollback(&self) {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

struct InMemoryReceiver {
    entity: String,
    mode: ReceiveMode,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl InMemoryReceiver {
    fn settle(
        &self,
        message: &ReceivedMessage,
        settlement: Settlement,
        transaction: Option<&Transaction>,
    ) -> Result<(), BrokerError> {
        if self.mode == ReceiveMode::ReceiveAndDelete {
            return Err(BrokerError::Other(
                "messages received in receive-and-delete mode cannot be settled".into(),
            ));
        }
        let record = SettlementRecord {
            entity: self.entity.clone(),
            message_id: message.message_id.clone(),
            settlement,
            transaction_id: transaction.map(|t| t.id().to_string()),
        };
        match transaction {
            Some(txn) => txn
                .enlist(Box::new(StagedSettlement {
                    shared: Arc::clone(&self.shared),
                    staged: Mutex::new(Some(record)),
                }))
                .map_err(|err| BrokerError::Other(err.to_string())),
            None => {
                self.shared.apply_settlement(record);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MessageReceiver for InMemoryReceiver {
    async fn receive(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let arrived = self.shared.arrivals.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Other(format!(
                    "receiver for '{}' is closed",
                    self.entity
                )));
            }
            {
                let mut state = self.shared.state();
                if let Some(err) = state.receive_failures.pop_front() {
                    return Err(err);
                }
                if let Some(mut message) = state
                    .inboxes
                    .get_mut(&self.entity)
                    .and_then(VecDeque::pop_front)
                {
                    message.delivery_count += 1;
                    match self.mode {
                        ReceiveMode::PeekLock => {
                            if message.locked_until.is_none() {
                                message.locked_until =
                                    Some(SystemTime::now() + DEFAULT_LOCK_DURATION);
                            }
                        }
                        ReceiveMode::ReceiveAndDelete => message.locked_until = None,
                    }
                    return Ok(Some(message));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = arrived => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn complete(
        &self,
        message: &ReceivedMessage,
        transaction: Option<&Transaction>,
    ) -> Result<(), BrokerError> {
        if let Some(err) = self.shared.state().complete_failures.pop_front() {
            return Err(err);
        }
        self.settle(message, Settlement::Completed, transaction)
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        if let Some(err) = self.shared.state().abandon_failures.pop_front() {
            return Err(err);
        }
        self.settle(message, Settlement::Abandoned, None)
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        self.settle(
            message,
            Settlement::DeadLettered {
                reason: reason.to_string(),
                description: description.to_string(),
            },
            None,
        )
    }

    fn set_prefetch_count(&self, prefetch_count: u32) {
        self.shared
            .state()
            .prefetch_counts
            .insert(self.entity.clone(), prefetch_count);
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared
                .state()
                .closed_receivers
                .push(self.entity.clone());
            self.shared.arrivals.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl AdministrationClient for InMemoryBroker {
    async fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
        Ok(self.shared.state().topics.contains(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<(), BrokerError> {
        self.shared.state().topics.insert(topic.to_string());
        Ok(())
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        forward_to: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        if !state.topics.contains(topic) {
            return Err(BrokerError::EntityNotFound(topic.to_string()));
        }
        state
            .subscriptions
            .entry((topic.to_string(), subscription.to_string()))
            .or_insert_with(|| forward_to.to_string());
        Ok(())
    }

    async fn delete_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), BrokerError> {
        let key = (topic.to_string(), subscription.to_string());
        let mut state = self.shared.state();
        state.rules.remove(&key);
        state
            .subscriptions
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| BrokerError::EntityNotFound(format!("{}/{}", topic, subscription)))
    }

    async fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
        filter: &str,
    ) -> Result<(), BrokerError> {
        let key = (topic.to_string(), subscription.to_string());
        let mut state = self.shared.state();
        if !state.subscriptions.contains_key(&key) {
            return Err(BrokerError::EntityNotFound(format!("{}/{}", topic, subscription)));
        }
        let rules = state.rules.entry(key).or_default();
        match rules.iter_mut().find(|(name, _)| name == rule) {
            Some(existing) => existing.1 = filter.to_string(),
            None => rules.push((rule.to_string(), filter.to_string())),
        }
        Ok(())
    }

    async fn delete_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> Result<(), BrokerError> {
        let key = (topic.to_string(), subscription.to_string());
        let mut state = self.shared.state();
        let rules = state
            .rules
            .get_mut(&key)
            .ok_or_else(|| BrokerError::EntityNotFound(rule.to_string()))?;
        let before = rules.len();
        rules.retain(|(name, _)| name != rule);
        if rules.len() == before {
            return Err(BrokerError::EntityNotFound(rule.to_string()));
        }
        Ok(())
    }
}
