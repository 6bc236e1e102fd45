//! Error types shared across the transport.

use std::error::Error;

use thiserror::Error;

/// Failure reported by the broker client boundary.
///
/// Native client errors are mapped into one of these classes so the
/// dispatcher and the pump can decide what is safe to swallow, retry, or
/// propagate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The queue, topic, or subscription does not exist.
    #[error("messaging entity not found: {0}")]
    EntityNotFound(String),
    /// The broker could not be reached.
    #[error("service communication problem: {0}")]
    Communication(String),
    /// The broker is throttling requests.
    #[error("service busy: {0}")]
    ServiceBusy(String),
    /// The broker did not answer in time.
    #[error("service timeout: {0}")]
    ServiceTimeout(String),
    /// The lock on a received message expired or was lost.
    #[error("message lock lost: {0}")]
    MessageLockLost(String),
    /// The message (or batch) exceeds the broker's size limit.
    #[error("message size exceeded: {0}")]
    MessageSizeExceeded(String),
    /// Any other broker failure.
    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Communication(_)
                | BrokerError::ServiceBusy(_)
                | BrokerError::ServiceTimeout(_)
        )
    }

    pub fn is_lock_lost(&self) -> bool {
        matches!(self, BrokerError::MessageLockLost(_))
    }

    pub fn is_entity_not_found(&self) -> bool {
        matches!(self, BrokerError::EntityNotFound(_))
    }

    /// Whether the failure means the broker endpoint is unreachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BrokerError::Communication(_))
    }
}

/// Error returned from `MessageDispatcher::dispatch`.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A multicast operation names an event type with no topic mapping and the
    /// topology is configured to fail fast.
    #[error("event type '{0}' is not mapped to any topic")]
    UnroutableEvent(String),
    /// Too many batchable operations for a single broker transaction.
    #[error(
        "the transaction contains {count} outgoing messages, which exceeds the broker limit of {limit} messages per transaction"
    )]
    TransactionLimitExceeded { count: usize, limit: usize },
    /// Sending to a destination failed.
    #[error("failed to send to '{destination}': {source}")]
    Send {
        destination: String,
        #[source]
        source: BrokerError,
    },
    /// The ambient transaction could not take part in the send.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl DispatchError {
    /// The broker failure behind this error, if any.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            DispatchError::Send { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Error raised by the ambient transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// The transaction was already committed or rolled back.
    #[error("transaction {0} is no longer active")]
    NotActive(String),
    /// A participating scope did not complete, so the transaction can only roll back.
    #[error("transaction {0} was doomed by an incomplete scope and has been rolled back")]
    Doomed(String),
    /// An enlisted resource failed to commit.
    #[error("transaction {id} failed to commit: {source}")]
    Commit {
        id: String,
        #[source]
        source: BrokerError,
    },
}

/// Aggregate error returned when one or more senders fail to close.
#[derive(Debug, Error)]
#[error("failed to close {} sender(s): {}", .failures.len(), describe_close_failures(.failures))]
pub struct CloseError {
    pub failures: Vec<(String, BrokerError)>,
}

fn describe_close_failures(failures: &[(String, BrokerError)]) -> String {
    failures
        .iter()
        .map(|(destination, err)| format!("{} ({})", destination, err))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error returned by host-supplied message and error callbacks.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Processing stopped because the pump is shutting down.
    #[error("message processing was cancelled")]
    Cancelled,
    /// A broker call made from inside the callback failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// Application failure.
    #[error("handler failed: {0}")]
    Failed(Box<dyn Error + Send + Sync>),
}

impl HandlerError {
    /// Wrap any application error.
    pub fn failed(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        HandlerError::Failed(err.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HandlerError::Cancelled)
    }

    /// The broker failure behind this error, if any.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            HandlerError::Broker(err) => Some(err),
            HandlerError::Failed(err) => err.downcast_ref::<BrokerError>(),
            HandlerError::Cancelled => None,
        }
    }
}

impl From<DispatchError> for HandlerError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Send { source, .. } => HandlerError::Broker(source),
            other => HandlerError::Failed(Box::new(other)),
        }
    }
}

/// Error returned by pump lifecycle operations.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("the pump has not been initialized")]
    NotInitialized,
    #[error("cannot {operation} while the pump is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("invalid pump settings: {0}")]
    Settings(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Error raised by topology validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("invalid topology: {0}")]
    Invalid(String),
    #[error("invalid topology options: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for TopologyError {
    fn from(err: serde_json::Error) -> Self {
        TopologyError::Parse(err.to_string())
    }
}
