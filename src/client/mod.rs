//! Broker client seams.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     BrokerClient (connection)                 │
//! │  create_sender(destination) / create_receiver(entity, opts)   │
//! └──────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌─────────────────────────┐      ┌──────────────────────────────┐
//! │      BrokerSender       │      │       MessageReceiver        │
//! │ create_batch/send_batch │      │ receive/complete/abandon     │
//! │ send_message/close      │      │ dead_letter/set_prefetch     │
//! └─────────────────────────┘      └──────────────────────────────┘
//! ```
//!
//! `AdministrationClient` covers provisioning used by subscription managers.
//! `InMemoryBroker` implements all of them for tests.

mod client;
#[cfg(feature = "in-memory")]
mod in_memory;

pub use client::{
    AdministrationClient, BrokerClient, BrokerSender, MessageBatch, MessageReceiver, ReceiveMode,
    ReceiverOptions,
};
#[cfg(feature = "in-memory")]
pub use in_memory::{InMemoryBatch, InMemoryBroker, SendRecord, Settlement, SettlementRecord};
