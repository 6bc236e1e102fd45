//! Inbound path - the receive pump and what it relies on.
//!
//! ## Per-message protocol
//!
//! ```text
//! pull ─► no id? ─────────────────────────► dead-letter
//!      ─► in completion cache (receive-only) ► complete, skip handler
//!      ─► lock already expired ────────────► abandon
//!      ─► unreadable headers ──────────────► dead-letter
//!      ─► on_message ─ ok ─► complete + commit
//!                    └ err ─► on_error ─ Handled ─► complete + commit
//!                                      └ RetryRequired ─► abandon
//! ```
//!
//! Receive failures feed the `CircuitBreaker`; handler failures never do.

mod circuit_breaker;
mod completion_cache;
mod context;
mod pump;
mod settings;

pub use circuit_breaker::{
    CircuitBreaker, Throttle, DEFAULT_FAILURE_DELAY, DEFAULT_TIME_TO_WAIT_BEFORE_TRIGGERING,
};
pub use completion_cache::{CompletionCache, DEFAULT_COMPLETION_CACHE_CAPACITY};
pub use context::{
    CriticalError, ErrorContext, ErrorHandleResult, ErrorHandler, LogCriticalError,
    MessageContext, MessageHandler,
};
pub use pump::{MessagePump, PumpStatus};
pub use settings::{
    PumpSettings, TransportTransactionMode, DEFAULT_PREFETCH_MULTIPLIER, DEFAULT_RECEIVE_WAIT,
};
