//! Topology: how event types map to topics and subscriptions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::options::{MigrationOptions, TopicPerEventOptions};
use super::subscription_manager::{
    BundleRuleSubscriptionManager, MigrationSubscriptionManager, SubscriptionManager,
    TopicPerEventSubscriptionManager,
};
use crate::client::AdministrationClient;
use crate::error::{DispatchError, TopologyError};

/// Read-only routing topology, fixed after startup.
///
/// ## Example
///
/// ```
/// use servicebus_transport::topology::{Topology, TopicPerEventOptions};
///
/// let topology = Topology::topic_per_event(
///     TopicPerEventOptions::new().publish("Sales.OrderPlaced", "sales-events"),
/// );
/// assert_eq!(
///     topology.publish_destinations("Sales.OrderPlaced").unwrap(),
///     vec!["sales-events".to_string()]
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    TopicPerEvent(TopicPerEventOptions),
    Migration(MigrationOptions),
}

impl Default for Topology {
    fn default() -> Self {
        Topology::TopicPerEvent(TopicPerEventOptions::default())
    }
}

impl Topology {
    pub fn topic_per_event(options: TopicPerEventOptions) -> Self {
        Topology::TopicPerEvent(options)
    }

    pub fn migration(options: MigrationOptions) -> Self {
        Topology::Migration(options)
    }

    /// Parse and validate a topology from JSON.
    ///
    /// ```
    /// use servicebus_transport::topology::Topology;
    ///
    /// let topology = Topology::from_json(
    ///     r#"{"kind":"migration","topic_to_publish_to":"bundle-2","topic_to_subscribe_on":"bundle-2"}"#,
    /// ).unwrap();
    /// assert!(matches!(topology, Topology::Migration(_)));
    /// ```
    pub fn from_json(json: &str) -> Result<Self, TopologyError> {
        let topology: Topology = serde_json::from_str(json)?;
        topology.validate()?;
        Ok(topology)
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        match self {
            Topology::TopicPerEvent(options) => options.validate(),
            Topology::Migration(options) => options.validate(),
        }
    }

    /// The topic-per-event tables in effect for this topology.
    pub fn topic_per_event_options(&self) -> &TopicPerEventOptions {
        match self {
            Topology::TopicPerEvent(options) => options,
            Topology::Migration(options) => &options.topic_per_event,
        }
    }

    /// Topics an event of the given type is published to.
    pub fn publish_destinations(&self, event_type: &str) -> Result<Vec<String>, DispatchError> {
        match self {
            Topology::Migration(options) if !options.is_migrated(event_type) => {
                Ok(vec![options.topic_to_publish_to.clone()])
            }
            _ => {
                let options = self.topic_per_event_options();
                mapped_or_default(&options.publish_to, options.throw_if_unmapped, event_type)
            }
        }
    }

    /// Topics to subscribe on for an event of the given type.
    pub fn subscribe_destinations(&self, event_type: &str) -> Result<Vec<String>, DispatchError> {
        match self {
            Topology::Migration(options) if !options.is_migrated(event_type) => {
                Ok(vec![options.topic_to_subscribe_on.clone()])
            }
            _ => {
                let options = self.topic_per_event_options();
                mapped_or_default(&options.subscribe_to, options.throw_if_unmapped, event_type)
            }
        }
    }

    /// Name of the subscription that forwards into `queue`.
    pub fn subscription_name(&self, queue: &str) -> String {
        self.topic_per_event_options()
            .queue_name_to_subscription_name
            .get(queue)
            .cloned()
            .unwrap_or_else(|| queue.to_string())
    }

    /// Rule name used for an event type on the bundle subscription.
    pub fn rule_name(&self, event_type: &str) -> String {
        match self {
            Topology::Migration(options) => options
                .subscribed_event_to_rule_name
                .get(event_type)
                .cloned()
                .unwrap_or_else(|| event_type.to_string()),
            Topology::TopicPerEvent(_) => event_type.to_string(),
        }
    }

    /// Build the subscription manager for this topology variant.
    pub fn subscription_manager(
        self: &Arc<Self>,
        admin: Arc<dyn AdministrationClient>,
        input_queue: &str,
    ) -> Arc<dyn SubscriptionManager> {
        let subscription = self.subscription_name(input_queue);
        match self.as_ref() {
            Topology::TopicPerEvent(_) => Arc::new(TopicPerEventSubscriptionManager::new(
                Arc::clone(self),
                admin,
                subscription,
                input_queue,
            )),
            Topology::Migration(options) => {
                let per_event = TopicPerEventSubscriptionManager::new(
                    Arc::clone(self),
                    Arc::clone(&admin),
                    subscription.clone(),
                    input_queue,
                );
                let bundle = BundleRuleSubscriptionManager::new(
                    Arc::clone(self),
                    admin,
                    options.topic_to_subscribe_on.clone(),
                    subscription,
                    input_queue,
                );
                Arc::new(MigrationSubscriptionManager::new(
                    Arc::clone(self),
                    per_event,
                    bundle,
                ))
            }
        }
    }
}

fn mapped_or_default(
    map: &std::collections::HashMap<String, Vec<String>>,
    throw_if_unmapped: bool,
    event_type: &str,
) -> Result<Vec<String>, DispatchError> {
    match map.get(event_type) {
        Some(topics) => Ok(topics.clone()),
        None if throw_if_unmapped => Err(DispatchError::UnroutableEvent(event_type.to_string())),
        None => Ok(vec![event_type.to_string()]),
    }
}
