//! Outbound path - batching dispatcher and the per-destination sender cache.
//!
//! ```text
//! operations ──► DestinationRouter ──► MessageDispatcher ──► SenderRegistry ──► BrokerSender
//!                                      (isolated | batched)
//! ```

mod dispatcher;
mod sender_registry;
mod settings;

pub use dispatcher::{MessageDispatcher, CONNECTIVITY_GUIDANCE};
pub use sender_registry::SenderRegistry;
pub use settings::{DispatchSettings, DEFAULT_MAX_MESSAGES_PER_TRANSACTION};
