//! Receive pump integration tests against the in-memory broker.
//!
//! - Settlement protocol and the error callback
//! - Transaction modes
//! - Lifecycle, concurrency changes, and graceful stop
//! - Circuit breaker throttling on persistent receive failures

mod support;
mod breaker;
mod settlement;
