//! Outgoing messages and the operations that carry them to the dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::native::BrokerMessage;

/// An application message ready to be handed to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Unique identifier for this message
    pub id: String,
    /// Application headers
    pub headers: HashMap<String, String>,
    /// Serialized body
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    /// Create a new message with the given id and body.
    pub fn new(id: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            headers: HashMap::new(),
            body,
        }
    }

    /// Create a message with a bitcode-serialized body.
    pub fn encode<T: serde::Serialize>(
        id: impl Into<String>,
        body: &T,
    ) -> Result<Self, bitcode::Error> {
        let bytes = bitcode::serialize(body)?;
        Ok(Self::new(id, bytes))
    }

    /// Decode the body from bitcode binary format.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, bitcode::Error> {
        bitcode::deserialize(&self.body)
    }

    /// Add a header to the message.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get a header value by key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }
}

/// Where an operation is going.
///
/// Unicast operations name a queue. Multicast operations name an event type
/// that the topology maps to one or more topics.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AddressTag {
    Unicast(String),
    Multicast(String),
}

impl AddressTag {
    pub fn is_multicast(&self) -> bool {
        matches!(self, AddressTag::Multicast(_))
    }
}

/// Whether an operation may share a network call with other operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DispatchConsistency {
    /// The operation may be batched and enlisted in the ambient transaction.
    #[default]
    Default,
    /// The operation is always sent on its own, outside the ambient transaction.
    Isolated,
}

/// Delivery constraints attached to an operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchProperties {
    /// Deliver no earlier than this long after the send.
    pub delay_delivery_with: Option<Duration>,
    /// Deliver no earlier than this instant.
    pub do_not_deliver_before: Option<SystemTime>,
    /// Discard the message if it has not been received within this window.
    pub discard_if_not_received_before: Option<Duration>,
}

impl DispatchProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_delivery_with = Some(delay);
        self
    }

    pub fn with_not_before(mut self, at: SystemTime) -> Self {
        self.do_not_deliver_before = Some(at);
        self
    }

    pub fn with_time_to_be_received(mut self, ttl: Duration) -> Self {
        self.discard_if_not_received_before = Some(ttl);
        self
    }

    /// The instant the broker should make the message visible, if deferred.
    pub fn scheduled_enqueue_time(&self, now: SystemTime) -> Option<SystemTime> {
        match (self.do_not_deliver_before, self.delay_delivery_with) {
            (Some(at), _) => Some(at),
            (None, Some(delay)) => Some(now + delay),
            (None, None) => None,
        }
    }
}

/// Last-chance mutation of the native message before it is sent.
pub type MessageCustomizer = Arc<dyn Fn(&mut BrokerMessage) + Send + Sync>;

/// A single message plus everything the dispatcher needs to route and send it.
///
/// Operations are immutable once built; the dispatcher only reads them.
#[derive(Clone)]
pub struct OutgoingOperation {
    message: OutgoingMessage,
    address: AddressTag,
    properties: DispatchProperties,
    consistency: DispatchConsistency,
    customizer: Option<MessageCustomizer>,
}

impl OutgoingOperation {
    /// Send the message to a single named queue.
    pub fn unicast(message: OutgoingMessage, destination: impl Into<String>) -> Self {
        Self::with_address(message, AddressTag::Unicast(destination.into()))
    }

    /// Publish the message to every topic mapped for the event type.
    pub fn multicast(message: OutgoingMessage, event_type: impl Into<String>) -> Self {
        Self::with_address(message, AddressTag::Multicast(event_type.into()))
    }

    fn with_address(message: OutgoingMessage, address: AddressTag) -> Self {
        Self {
            message,
            address,
            properties: DispatchProperties::default(),
            consistency: DispatchConsistency::Default,
            customizer: None,
        }
    }

    /// Require the operation to be sent on its own.
    pub fn isolated(mut self) -> Self {
        self.consistency = DispatchConsistency::Isolated;
        self
    }

    pub fn with_properties(mut self, properties: DispatchProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Attach a callback that adjusts the native message just before sending.
    pub fn with_customizer<F>(mut self, customizer: F) -> Self
    where
        F: Fn(&mut BrokerMessage) + Send + Sync + 'static,
    {
        self.customizer = Some(Arc::new(customizer));
        self
    }

    pub fn message(&self) -> &OutgoingMessage {
        &self.message
    }

    pub fn address(&self) -> &AddressTag {
        &self.address
    }

    pub fn properties(&self) -> &DispatchProperties {
        &self.properties
    }

    pub fn consistency(&self) -> DispatchConsistency {
        self.consistency
    }

    pub fn customizer(&self) -> Option<&MessageCustomizer> {
        self.customizer.as_ref()
    }
}

impl fmt::Debug for OutgoingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingOperation")
            .field("message_id", &self.message.id)
            .field("address", &self.address)
            .field("properties", &self.properties)
            .field("consistency", &self.consistency)
            .field("customized", &self.customizer.is_some())
            .finish()
    }
}
