//! Topology - event-to-topic mapping and subscription wiring.
//!
//! Two variants, chosen at startup:
//! - `Topology::TopicPerEvent` - every event type has its own topic(s)
//! - `Topology::Migration` - unmigrated events share a bundle topic and are
//!   filtered per subscriber with rules
//!
//! Each variant builds its own `SubscriptionManager`.

mod options;
mod subscription_manager;
mod topology;

pub use options::{
    MigrationOptions, TopicPerEventOptions, DEFAULT_BUNDLE_TOPIC, MAX_SUBSCRIPTION_NAME_LENGTH,
    MAX_TOPIC_NAME_LENGTH,
};
pub use subscription_manager::{
    BundleRuleSubscriptionManager, InfrastructureGate, MigrationSubscriptionManager,
    SubscriptionManager, TopicPerEventSubscriptionManager, DEFAULT_RULE_NAME,
};
pub use topology::Topology;
