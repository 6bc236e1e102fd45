//! Broker-native message shapes on both sides of the wire.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use thiserror::Error;

use super::headers;

/// A message as handed to a broker sender.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BrokerMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    /// Application headers, sent as string application properties
    pub application_properties: HashMap<String, String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub reply_to: Option<String>,
    pub subject: Option<String>,
    /// Session/partition affinity for the message
    pub partition_key: Option<String>,
    /// Partition the enclosing transaction is pinned to
    pub transaction_partition_key: Option<String>,
    pub scheduled_enqueue_time: Option<SystemTime>,
    pub time_to_live: Option<Duration>,
}

impl BrokerMessage {
    pub fn new(message_id: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            body,
            ..Default::default()
        }
    }

    /// Rough wire size used by size-bounded batches.
    pub fn size_in_bytes(&self) -> usize {
        let properties: usize = self
            .application_properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.message_id.len() + self.body.len() + properties
    }
}

/// Why a received message could not be turned into headers and body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("application property '{0}' has an unsupported value type")]
    UnsupportedPropertyValue(String),
}

/// A message pulled from the broker and not yet acknowledged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReceivedMessage {
    /// Native message id. A message without one cannot be processed.
    pub message_id: Option<String>,
    pub lock_token: String,
    /// When the current lock expires. `None` for receive-and-delete deliveries.
    pub locked_until: Option<SystemTime>,
    pub delivery_count: u32,
    pub body: Vec<u8>,
    pub application_properties: HashMap<String, Value>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub reply_to: Option<String>,
    pub partition_key: Option<String>,
    pub time_to_live: Option<Duration>,
}

impl ReceivedMessage {
    pub fn new(message_id: impl Into<String>, body: Vec<u8>) -> Self {
        let message_id = message_id.into();
        Self {
            lock_token: message_id.clone(),
            message_id: Some(message_id),
            body,
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_locked_until(mut self, until: SystemTime) -> Self {
        self.locked_until = Some(until);
        self
    }

    /// Whether the lock has already expired relative to `now`.
    pub fn lock_expired(&self, now: SystemTime) -> bool {
        self.locked_until.is_some_and(|until| until <= now)
    }

    /// Decode the body from bitcode binary format.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, bitcode::Error> {
        bitcode::deserialize(&self.body)
    }

    /// Build the application headers for this message.
    ///
    /// Scalar application properties become string headers. Native
    /// correlation id, content type, reply-to, and time to live fill the
    /// matching header when the sender did not set it explicitly.
    pub fn extract_headers(&self) -> Result<HashMap<String, String>, ExtractionError> {
        let mut result = HashMap::with_capacity(self.application_properties.len() + 4);

        for (key, value) in &self.application_properties {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Null => String::new(),
                Value::Array(_) | Value::Object(_) => {
                    return Err(ExtractionError::UnsupportedPropertyValue(key.clone()))
                }
            };
            result.insert(key.clone(), text);
        }

        let natives = [
            (headers::CORRELATION_ID, self.correlation_id.clone()),
            (headers::CONTENT_TYPE, self.content_type.clone()),
            (headers::REPLY_TO_ADDRESS, self.reply_to.clone()),
            (
                headers::TIME_TO_BE_RECEIVED,
                self.time_to_live.map(|ttl| ttl.as_secs().to_string()),
            ),
        ];
        for (key, value) in natives {
            if let Some(value) = value {
                result.entry(key.to_string()).or_insert(value);
            }
        }

        if let Some(id) = &self.message_id {
            result
                .entry(headers::MESSAGE_ID.to_string())
                .or_insert_with(|| id.clone());
        }

        Ok(result)
    }
}
