//! Batching dispatcher integration tests against the in-memory broker.
//!
//! - Batch packing, oversized fallback, and destination partitioning
//! - Isolated operations
//! - Ambient transactions and the per-transaction message limit
//! - Destination-not-found and connectivity policies

mod support;
mod batching;
mod failures;
mod transactions;
