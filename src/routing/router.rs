use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, Span};

use crate::error::DispatchError;
use crate::message::{headers, AddressTag, OutgoingOperation};
use crate::topology::Topology;

/// Namespace prefixing applied to every resolved destination.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingOptions {
    /// Prefix destinations with `<namespace>/`
    pub namespace: Option<String>,
    /// Message types whose destinations are never prefixed
    pub prefix_exempt_types: HashSet<String>,
}

impl RoutingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn exempt(mut self, message_type: impl Into<String>) -> Self {
        self.prefix_exempt_types.insert(message_type.into());
        self
    }

    fn apply(&self, destination: String) -> String {
        match &self.namespace {
            Some(namespace) if !destination.starts_with(&format!("{}/", namespace)) => {
                format!("{}/{}", namespace, destination)
            }
            _ => destination,
        }
    }
}

/// Physical destinations for one logical address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub names: Vec<String>,
    /// Topic semantics: a missing destination counts as zero subscribers.
    pub is_multicast: bool,
}

/// Resolves operation addresses against the topology.
///
/// Results are cached per (address, prefix exemption). The topology is fixed
/// after startup, so entries are never invalidated.
pub struct DestinationRouter {
    topology: Arc<Topology>,
    options: RoutingOptions,
    cache: Mutex<HashMap<(AddressTag, bool), ResolvedDestination>>,
    span: Span,
}

impl DestinationRouter {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self {
            topology,
            options: RoutingOptions::default(),
            cache: Mutex::new(HashMap::new()),
            span: tracing::info_span!("destination_router"),
        }
    }

    pub fn with_options(mut self, options: RoutingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Resolve the destinations an operation is sent to.
    pub fn resolve_operation(
        &self,
        operation: &OutgoingOperation,
    ) -> Result<ResolvedDestination, DispatchError> {
        let message_type = match operation.address() {
            AddressTag::Multicast(event_type) => Some(event_type.as_str()),
            AddressTag::Unicast(_) => operation
                .message()
                .header(headers::ENCLOSED_MESSAGE_TYPES)
                .and_then(|types| types.split(';').next())
                .map(str::trim),
        };
        let exempt = message_type.is_some_and(|t| self.options.prefix_exempt_types.contains(t));
        self.resolve(operation.address(), exempt)
    }

    /// Resolve an address, skipping namespace prefixing when `exempt`.
    pub fn resolve(
        &self,
        address: &AddressTag,
        exempt: bool,
    ) -> Result<ResolvedDestination, DispatchError> {
        let key = (address.clone(), exempt);
        if let Some(hit) = self.cache().get(&key) {
            return Ok(hit.clone());
        }

        let _entered = self.span.enter();
        let names = match address {
            AddressTag::Unicast(destination) => vec![strip_reply_suffix(destination).to_string()],
            AddressTag::Multicast(event_type) => self.topology.publish_destinations(event_type)?,
        };
        let names = if exempt {
            names
        } else {
            names.into_iter().map(|n| self.options.apply(n)).collect()
        };
        let resolved = ResolvedDestination {
            names,
            is_multicast: address.is_multicast(),
        };
        debug!(?address, destinations = ?resolved.names, "resolved destination");

        self.cache().insert(key, resolved.clone());
        Ok(resolved)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<(AddressTag, bool), ResolvedDestination>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop a trailing `@machine` segment carried over from older reply addresses.
fn strip_reply_suffix(destination: &str) -> &str {
    destination
        .split_once('@')
        .map_or(destination, |(queue, _)| queue)
}
