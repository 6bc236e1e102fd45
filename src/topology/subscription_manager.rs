//! Subscription managers, one per way of wiring events to an input queue.
//!
//! - `TopicPerEventSubscriptionManager` - one forwarding subscription per topic
//! - `BundleRuleSubscriptionManager` - one filter rule per event type on the
//!   endpoint's subscription to the bundle topic
//! - `MigrationSubscriptionManager` - migrated events go topic-per-event, the
//!   rest go through bundle rules

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::topology::Topology;
use crate::client::AdministrationClient;
use crate::error::{BrokerError, DispatchError};
use crate::message::headers;

/// Rule name of the catch-all filter a new subscription starts with.
pub const DEFAULT_RULE_NAME: &str = "$default";

/// Wires event types to an endpoint's input queue.
#[async_trait]
pub trait SubscriptionManager: Send + Sync {
    async fn subscribe(&self, event_type: &str) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, event_type: &str) -> Result<(), BrokerError>;

    async fn subscribe_all(&self, event_types: &[String]) -> Result<(), BrokerError> {
        for event_type in event_types {
            self.subscribe(event_type).await?;
        }
        Ok(())
    }
}

/// Runs shared infrastructure setup at most once.
///
/// A failed setup is retried by the next caller; a successful one is never
/// repeated.
#[derive(Default)]
pub struct InfrastructureGate {
    ready: OnceCell<()>,
}

impl InfrastructureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    pub async fn ensure<F, Fut>(&self, setup: F) -> Result<(), BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), BrokerError>>,
    {
        self.ready.get_or_try_init(setup).await.map(|_| ())
    }
}

fn routing_error(err: DispatchError) -> BrokerError {
    BrokerError::Other(err.to_string())
}

fn ignore_missing(result: Result<(), BrokerError>) -> Result<(), BrokerError> {
    match result {
        Err(err) if err.is_entity_not_found() => Ok(()),
        other => other,
    }
}

async fn ensure_topic(admin: &dyn AdministrationClient, topic: &str) -> Result<(), BrokerError> {
    if !admin.topic_exists(topic).await? {
        info!(topic, "creating topic");
        admin.create_topic(topic).await?;
    }
    Ok(())
}

/// Subscribes by creating a forwarding subscription on every topic mapped
/// for the event type.
pub struct TopicPerEventSubscriptionManager {
    topology: Arc<Topology>,
    admin: Arc<dyn AdministrationClient>,
    subscription: String,
    input_queue: String,
}

impl TopicPerEventSubscriptionManager {
    pub fn new(
        topology: Arc<Topology>,
        admin: Arc<dyn AdministrationClient>,
        subscription: impl Into<String>,
        input_queue: impl Into<String>,
    ) -> Self {
        Self {
            topology,
            admin,
            subscription: subscription.into(),
            input_queue: input_queue.into(),
        }
    }
}

#[async_trait]
impl SubscriptionManager for TopicPerEventSubscriptionManager {
    /// No shared infrastructure: each mapped topic is created on demand.
    async fn subscribe(&self, event_type: &str) -> Result<(), BrokerError> {
        let topics = self
            .topology
            .subscribe_destinations(event_type)
            .map_err(routing_error)?;
        for topic in topics {
            ensure_topic(self.admin.as_ref(), &topic).await?;
            debug!(topic = %topic, subscription = %self.subscription, event_type, "subscribing");
            self.admin
                .create_subscription(&topic, &self.subscription, &self.input_queue)
                .await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, event_type: &str) -> Result<(), BrokerError> {
        let topics = self
            .topology
            .subscribe_destinations(event_type)
            .map_err(routing_error)?;
        for topic in topics {
            debug!(topic = %topic, subscription = %self.subscription, event_type, "unsubscribing");
            ignore_missing(
                self.admin
                    .delete_subscription(&topic, &self.subscription)
                    .await,
            )?;
        }
        Ok(())
    }
}

/// Subscribes by adding a filter rule to the endpoint's bundle subscription.
pub struct BundleRuleSubscriptionManager {
    topology: Arc<Topology>,
    admin: Arc<dyn AdministrationClient>,
    topic: String,
    subscription: String,
    input_queue: String,
    gate: InfrastructureGate,
}

impl BundleRuleSubscriptionManager {
    pub fn new(
        topology: Arc<Topology>,
        admin: Arc<dyn AdministrationClient>,
        topic: impl Into<String>,
        subscription: impl Into<String>,
        input_queue: impl Into<String>,
    ) -> Self {
        Self {
            topology,
            admin,
            topic: topic.into(),
            subscription: subscription.into(),
            input_queue: input_queue.into(),
            gate: InfrastructureGate::new(),
        }
    }

    /// SQL filter matching messages that carry the event type.
    pub fn filter_for(event_type: &str) -> String {
        format!(
            "[{}] LIKE '%{}%'",
            headers::ENCLOSED_MESSAGE_TYPES,
            event_type.replace('\'', "''")
        )
    }

    async fn setup_infrastructure(&self) -> Result<(), BrokerError> {
        ensure_topic(self.admin.as_ref(), &self.topic).await?;
        self.admin
            .create_subscription(&self.topic, &self.subscription, &self.input_queue)
            .await?;
        // New subscriptions must not match anything until a rule is added.
        self.admin
            .create_rule(&self.topic, &self.subscription, DEFAULT_RULE_NAME, "1=0")
            .await?;
        info!(topic = %self.topic, subscription = %self.subscription, "bundle subscription ready");
        Ok(())
    }
}

#[async_trait]
impl SubscriptionManager for BundleRuleSubscriptionManager {
    async fn subscribe(&self, event_type: &str) -> Result<(), BrokerError> {
        self.gate.ensure(|| self.setup_infrastructure()).await?;

        let rule = self.topology.rule_name(event_type);
        debug!(topic = %self.topic, rule = %rule, event_type, "adding subscription rule");
        self.admin
            .create_rule(
                &self.topic,
                &self.subscription,
                &rule,
                &Self::filter_for(event_type),
            )
            .await
    }

    async fn unsubscribe(&self, event_type: &str) -> Result<(), BrokerError> {
        let rule = self.topology.rule_name(event_type);
        debug!(topic = %self.topic, rule = %rule, event_type, "removing subscription rule");
        ignore_missing(
            self.admin
                .delete_rule(&self.topic, &self.subscription, &rule)
                .await,
        )
    }
}

/// Splits subscriptions between topic-per-event and the bundle topic.
pub struct MigrationSubscriptionManager {
    migrated: HashSet<String>,
    per_event: TopicPerEventSubscriptionManager,
    bundle: BundleRuleSubscriptionManager,
}

impl MigrationSubscriptionManager {
    pub fn new(
        topology: Arc<Topology>,
        per_event: TopicPerEventSubscriptionManager,
        bundle: BundleRuleSubscriptionManager,
    ) -> Self {
        let migrated = match topology.as_ref() {
            Topology::Migration(options) => options.events_to_migrate.clone(),
            Topology::TopicPerEvent(_) => HashSet::new(),
        };
        Self {
            migrated,
            per_event,
            bundle,
        }
    }

    fn manager_for(&self, event_type: &str) -> &dyn SubscriptionManager {
        if self.migrated.contains(event_type) {
            &self.per_event
        } else {
            &self.bundle
        }
    }
}

#[async_trait]
impl SubscriptionManager for MigrationSubscriptionManager {
    async fn subscribe(&self, event_type: &str) -> Result<(), BrokerError> {
        self.manager_for(event_type).subscribe(event_type).await
    }

    async fn unsubscribe(&self, event_type: &str) -> Result<(), BrokerError> {
        self.manager_for(event_type).unsubscribe(event_type).await
    }
}
