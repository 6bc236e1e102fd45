//! Option structs for each topology variant.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// Longest entity path the broker accepts for a topic.
pub const MAX_TOPIC_NAME_LENGTH: usize = 260;
/// Longest name the broker accepts for a subscription or a rule.
pub const MAX_SUBSCRIPTION_NAME_LENGTH: usize = 50;
pub const DEFAULT_BUNDLE_TOPIC: &str = "bundle-1";

/// Mapping tables for the topic-per-event topology.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicPerEventOptions {
    /// Event type → topics its instances are published to
    pub publish_to: HashMap<String, Vec<String>>,
    /// Event type → topics to subscribe on for it
    pub subscribe_to: HashMap<String, Vec<String>>,
    /// Input queue → subscription name overrides
    pub queue_name_to_subscription_name: HashMap<String, String>,
    /// Fail instead of falling back to the event type name when unmapped
    pub throw_if_unmapped: bool,
}

impl TopicPerEventOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(mut self, event_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.publish_to
            .entry(event_type.into())
            .or_default()
            .push(topic.into());
        self
    }

    pub fn subscribe(mut self, event_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.subscribe_to
            .entry(event_type.into())
            .or_default()
            .push(topic.into());
        self
    }

    pub fn with_subscription_name(
        mut self,
        queue: impl Into<String>,
        subscription: impl Into<String>,
    ) -> Self {
        self.queue_name_to_subscription_name
            .insert(queue.into(), subscription.into());
        self
    }

    pub fn throw_if_unmapped(mut self) -> Self {
        self.throw_if_unmapped = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), TopologyError> {
        for (event_type, topics) in self.publish_to.iter().chain(&self.subscribe_to) {
            if topics.is_empty() {
                return Err(TopologyError::Invalid(format!(
                    "event type '{}' is mapped to an empty topic list",
                    event_type
                )));
            }
            for topic in topics {
                validate_topic_name(topic)?;
            }
        }
        for (queue, subscription) in &self.queue_name_to_subscription_name {
            if subscription.is_empty() || subscription.len() > MAX_SUBSCRIPTION_NAME_LENGTH {
                return Err(TopologyError::Invalid(format!(
                    "subscription name '{}' for queue '{}' must be 1 to {} characters",
                    subscription, queue, MAX_SUBSCRIPTION_NAME_LENGTH
                )));
            }
        }
        Ok(())
    }
}

/// Options for the migration topology.
///
/// Events listed in `events_to_migrate` already use topic-per-event routing.
/// Everything else still flows through the single bundle topic, filtered per
/// subscriber by rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationOptions {
    pub topic_to_publish_to: String,
    pub topic_to_subscribe_on: String,
    pub events_to_migrate: HashSet<String>,
    /// Event type → rule name overrides on the bundle subscription
    pub subscribed_event_to_rule_name: HashMap<String, String>,
    #[serde(flatten)]
    pub topic_per_event: TopicPerEventOptions,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            topic_to_publish_to: DEFAULT_BUNDLE_TOPIC.to_string(),
            topic_to_subscribe_on: DEFAULT_BUNDLE_TOPIC.to_string(),
            events_to_migrate: HashSet::new(),
            subscribed_event_to_rule_name: HashMap::new(),
            topic_per_event: TopicPerEventOptions::default(),
        }
    }
}

impl MigrationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle_topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        self.topic_to_publish_to = topic.clone();
        self.topic_to_subscribe_on = topic;
        self
    }

    pub fn migrate(mut self, event_type: impl Into<String>) -> Self {
        self.events_to_migrate.insert(event_type.into());
        self
    }

    pub fn with_rule_name(mut self, event_type: impl Into<String>, rule: impl Into<String>) -> Self {
        self.subscribed_event_to_rule_name
            .insert(event_type.into(), rule.into());
        self
    }

    pub fn with_topic_per_event(mut self, options: TopicPerEventOptions) -> Self {
        self.topic_per_event = options;
        self
    }

    pub fn is_migrated(&self, event_type: &str) -> bool {
        self.events_to_migrate.contains(event_type)
    }

    pub(crate) fn validate(&self) -> Result<(), TopologyError> {
        validate_topic_name(&self.topic_to_publish_to)?;
        validate_topic_name(&self.topic_to_subscribe_on)?;
        for (event_type, rule) in &self.subscribed_event_to_rule_name {
            if self.is_migrated(event_type) {
                return Err(TopologyError::Invalid(format!(
                    "event type '{}' is migrated but also has a bundle rule override",
                    event_type
                )));
            }
            if rule.is_empty() || rule.len() > MAX_SUBSCRIPTION_NAME_LENGTH {
                return Err(TopologyError::Invalid(format!(
                    "rule name '{}' must be 1 to {} characters",
                    rule, MAX_SUBSCRIPTION_NAME_LENGTH
                )));
            }
        }
        self.topic_per_event.validate()
    }
}

fn validate_topic_name(topic: &str) -> Result<(), TopologyError> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_NAME_LENGTH {
        return Err(TopologyError::Invalid(format!(
            "topic name '{}' must be 1 to {} characters",
            topic, MAX_TOPIC_NAME_LENGTH
        )));
    }
    Ok(())
}
