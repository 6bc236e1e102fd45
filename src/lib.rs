//! Dispatch and receive core of a topic/queue broker transport.
//!
//! - [`routing`] resolves logical addresses to physical queues and topics
//! - [`dispatch`] packs outgoing operations into batches and sends them
//! - [`receive`] pulls messages concurrently and settles them safely
//! - [`transaction`] ties sends made while processing to the received message
//! - [`topology`] maps event types to topics and wires subscriptions
//! - [`client`] is the seam to the broker client library
//!
//! The transport never owns a broker connection. Everything goes through
//! [`client::BrokerClient`], which the in-memory broker implements for tests.

pub mod client;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod receive;
pub mod routing;
pub mod topology;
pub mod transaction;

pub use dispatch::{DispatchSettings, MessageDispatcher, SenderRegistry};
pub use error::{
    BrokerError, CloseError, DispatchError, HandlerError, PumpError, TopologyError,
    TransactionError,
};
pub use message::{
    AddressTag, BrokerMessage, DispatchConsistency, DispatchProperties, OutgoingMessage,
    OutgoingOperation, ReceivedMessage,
};
pub use receive::{
    CircuitBreaker, CompletionCache, CriticalError, ErrorContext, ErrorHandleResult,
    ErrorHandler, MessageContext, MessageHandler, MessagePump, PumpSettings, PumpStatus,
    TransportTransactionMode,
};
pub use routing::{DestinationRouter, ResolvedDestination, RoutingOptions};
pub use topology::{SubscriptionManager, Topology};
pub use transaction::{Transaction, TransactionBinding, TransactionScope};
