//! Messages on both sides of the transport.
//!
//! - `OutgoingMessage` / `OutgoingOperation` - what the application asks the
//!   dispatcher to send, plus routing and delivery constraints
//! - `BrokerMessage` - the native message a sender puts on the wire
//! - `ReceivedMessage` - a pulled, locked, not yet acknowledged message

pub mod headers;
mod native;
mod outgoing;

pub use native::{BrokerMessage, ExtractionError, ReceivedMessage};
pub use outgoing::{
    AddressTag, DispatchConsistency, DispatchProperties, MessageCustomizer, OutgoingMessage,
    OutgoingOperation,
};
