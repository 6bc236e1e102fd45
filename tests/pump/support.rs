//! Handlers, a critical error sink, and wait helpers for the pump tests.

#![allow(dead_code)]

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use servicebus_transport::client::InMemoryBroker;
use servicebus_transport::{
    CriticalError, ErrorContext, ErrorHandleResult, ErrorHandler, HandlerError, MessageContext,
    MessageDispatcher, MessageHandler, MessagePump, OutgoingMessage, OutgoingOperation,
    PumpSettings,
};
use tokio_util::sync::CancellationToken;

pub const INPUT: &str = "sales";

/// Route pump logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn settings() -> PumpSettings {
    PumpSettings::new()
        .with_max_concurrency(2)
        .with_receive_wait(Duration::from_millis(50))
}

/// Build, initialize, and start a pump on `INPUT`.
pub async fn start_pump(
    broker: &InMemoryBroker,
    settings: PumpSettings,
    on_message: Arc<dyn MessageHandler>,
    on_error: Arc<dyn ErrorHandler>,
    critical: Arc<dyn CriticalError>,
) -> MessagePump {
    init_tracing();
    let pump = MessagePump::new(Arc::new(broker.clone()), INPUT);
    pump.initialize(settings, on_message, on_error, critical)
        .await
        .unwrap();
    pump.start_receive().await.unwrap();
    pump
}

fn ids(list: &Mutex<Vec<String>>) -> Vec<String> {
    list.lock().unwrap().clone()
}

// ============================================================================
// Message handlers
// ============================================================================

/// Records every message and then succeeds or fails.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingHandler {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn seen(&self) -> Vec<String> {
        ids(&self.seen)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        context: &MessageContext,
        _cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(context.message_id.clone());
        if self.fail {
            return Err(HandlerError::Failed("handler failed".into()));
        }
        Ok(())
    }
}

/// Sends one message to `destination` inside the message's transaction.
pub struct DispatchingHandler {
    pub dispatcher: Arc<MessageDispatcher>,
    pub destination: String,
    pub fail_after_send: bool,
}

#[async_trait]
impl MessageHandler for DispatchingHandler {
    async fn handle(
        &self,
        context: &MessageContext,
        _cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        let reply = OutgoingOperation::unicast(
            OutgoingMessage::new(format!("reply-{}", context.message_id), b"{}".to_vec()),
            self.destination.clone(),
        );
        self.dispatcher
            .dispatch(&[reply], Some(&context.binding))
            .await
            .map_err(|err| HandlerError::Failed(Box::new(err)))?;
        if self.fail_after_send {
            return Err(HandlerError::Failed("failed after sending".into()));
        }
        Ok(())
    }
}

/// Runs until stopped, then either finishes or reports cancellation.
/// What a `SlowHandler` does once the pump cancels it.
#[derive(Clone, Copy)]
pub enum OnStop {
    Finish,
    Cancel,
    Fail,
}

pub struct SlowHandler {
    started: AtomicBool,
    on_stop: OnStop,
}

impl SlowHandler {
    pub fn new(on_stop: OnStop) -> Arc<Self> {
        Arc::new(Self {
            started: AtomicBool::new(false),
            on_stop,
        })
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(
        &self,
        _context: &MessageContext,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        cancel.cancelled().await;
        match self.on_stop {
            OnStop::Finish => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }
            OnStop::Cancel => Err(HandlerError::Cancelled),
            OnStop::Fail => Err(HandlerError::failed("database write failed")),
        }
    }
}

// ============================================================================
// Error handler and critical error sink
// ============================================================================

/// Returns a fixed outcome for every failed message.
pub struct ScriptedErrorHandler {
    outcome: fn() -> Result<ErrorHandleResult, HandlerError>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedErrorHandler {
    pub fn new(outcome: fn() -> Result<ErrorHandleResult, HandlerError>) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn handled() -> Arc<Self> {
        Self::new(|| Ok(ErrorHandleResult::Handled))
    }

    pub fn retry() -> Arc<Self> {
        Self::new(|| Ok(ErrorHandleResult::RetryRequired))
    }

    pub fn seen(&self) -> Vec<String> {
        ids(&self.seen)
    }
}

#[async_trait]
impl ErrorHandler for ScriptedErrorHandler {
    async fn handle(
        &self,
        context: &ErrorContext,
        _cancel: CancellationToken,
    ) -> Result<ErrorHandleResult, HandlerError> {
        self.seen
            .lock()
            .unwrap()
            .push(context.message.message_id.clone());
        (self.outcome)()
    }
}

#[derive(Default)]
pub struct RecordingCritical {
    raised: Mutex<Vec<String>>,
}

impl RecordingCritical {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raised(&self) -> Vec<String> {
        ids(&self.raised)
    }
}

#[async_trait]
impl CriticalError for RecordingCritical {
    async fn raise(
        &self,
        description: &str,
        _error: &(dyn Error + Send + Sync),
        _cancel: CancellationToken,
    ) {
        self.raised.lock().unwrap().push(description.to_string());
    }
}
