//! Concurrent receive pump.
//!
//! The pump runs one worker per concurrency slot. Each worker pulls a message,
//! takes it through the settlement protocol, and pulls again. Workers above
//! the current concurrency limit park until the limit grows.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument, Span};

use super::circuit_breaker::{CircuitBreaker, Throttle};
use super::completion_cache::CompletionCache;
use super::context::{
    CriticalError, ErrorContext, ErrorHandleResult, ErrorHandler, MessageContext, MessageHandler,
};
use super::settings::{PumpSettings, TransportTransactionMode};
use crate::client::{BrokerClient, MessageReceiver, ReceiverOptions};
use crate::error::{BrokerError, HandlerError, PumpError, TransactionError};
use crate::message::ReceivedMessage;
use crate::transaction::{Transaction, TransactionBinding, TransactionScope};

const MISSING_ID_REASON: &str = "Missing message id";
const UNREADABLE_REASON: &str = "Unreadable message";

/// Lifecycle state of a `MessagePump`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl PumpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PumpStatus::Stopped => "stopped",
            PumpStatus::Starting => "starting",
            PumpStatus::Running => "running",
            PumpStatus::Stopping => "stopping",
        }
    }
}

#[derive(Clone)]
struct Callbacks {
    on_message: Arc<dyn MessageHandler>,
    on_error: Arc<dyn ErrorHandler>,
    critical: Arc<dyn CriticalError>,
}

/// Effective concurrency limit, shared by the workers and the breaker.
struct ConcurrencyControl {
    configured: AtomicUsize,
    throttled: AtomicBool,
    limit: watch::Sender<usize>,
    receiver: Arc<dyn MessageReceiver>,
    settings: Mutex<PumpSettings>,
}

impl ConcurrencyControl {
    fn new(receiver: Arc<dyn MessageReceiver>, settings: PumpSettings) -> Self {
        let configured = settings.max_concurrency;
        let (limit, _) = watch::channel(configured);
        Self {
            configured: AtomicUsize::new(configured),
            throttled: AtomicBool::new(false),
            limit,
            receiver,
            settings: Mutex::new(settings),
        }
    }

    fn set_max_concurrency(&self, max_concurrency: usize) {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .max_concurrency = max_concurrency;
        self.configured.store(max_concurrency, Ordering::Release);
        self.publish();
    }

    fn subscribe(&self) -> watch::Receiver<usize> {
        self.limit.subscribe()
    }

    /// Push the effective limit to the workers and the receiver's prefetch.
    fn publish(&self) {
        let configured = self.configured.load(Ordering::Acquire);
        let limit = if self.throttled.load(Ordering::Acquire) {
            configured.min(1)
        } else {
            configured
        };
        let prefetch = self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .prefetch_for(limit);
        self.receiver.set_prefetch_count(prefetch);
        self.limit.send_replace(limit);
    }
}

impl Throttle for ConcurrencyControl {
    fn throttle(&self) {
        self.throttled.store(true, Ordering::Release);
        self.publish();
    }

    fn restore(&self) {
        self.throttled.store(false, Ordering::Release);
        self.publish();
    }
}

/// Everything the workers of one running pump share.
struct PumpShared {
    entity_path: String,
    client: Arc<dyn BrokerClient>,
    receiver: Arc<dyn MessageReceiver>,
    mode: TransportTransactionMode,
    receive_wait: Duration,
    callbacks: Callbacks,
    completion_cache: Arc<CompletionCache>,
    breaker: CircuitBreaker,
    control: Arc<ConcurrencyControl>,
    /// Stops pulling
    stop: CancellationToken,
    /// Handed to host callbacks
    cancel: CancellationToken,
}

struct Running {
    shared: Arc<PumpShared>,
    tracker: TaskTracker,
    workers: usize,
    span: Span,
}

impl Running {
    fn spawn_workers(&mut self, count: usize) {
        while self.workers < count {
            let shared = Arc::clone(&self.shared);
            let limit = shared.control.subscribe();
            let index = self.workers;
            self.tracker
                .spawn(run_worker(shared, index, limit).instrument(self.span.clone()));
            self.workers += 1;
        }
    }
}

struct Lifecycle {
    settings: PumpSettings,
    callbacks: Option<Callbacks>,
    running: Option<Running>,
}

/// Pulls messages from one queue or subscription and settles them.
///
/// ## Lifecycle
///
/// `Stopped → Starting → Running → Stopping → Stopped`. `initialize` is only
/// accepted while stopped; `start_receive` only while stopped and initialized.
///
/// ## Example
///
/// ```ignore
/// let pump = MessagePump::new(client, "sales");
/// pump.initialize(settings, handler, error_handler, critical).await?;
/// pump.start_receive().await?;
/// // ...
/// pump.stop_receive().await?;
/// ```
pub struct MessagePump {
    client: Arc<dyn BrokerClient>,
    entity_path: String,
    status: Mutex<PumpStatus>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    completion_cache: Mutex<Arc<CompletionCache>>,
    span: Span,
}

impl MessagePump {
    pub fn new(client: Arc<dyn BrokerClient>, entity_path: impl Into<String>) -> Self {
        let entity_path = entity_path.into();
        Self {
            span: tracing::info_span!("message_pump", entity = %entity_path),
            client,
            entity_path,
            status: Mutex::new(PumpStatus::Stopped),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                settings: PumpSettings::default(),
                callbacks: None,
                running: None,
            }),
            completion_cache: Mutex::new(Arc::new(CompletionCache::default())),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    pub fn status(&self) -> PumpStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn settings(&self) -> PumpSettings {
        self.lifecycle.lock().await.settings.clone()
    }

    /// Ids of messages processed but not yet known to be completed.
    pub fn completion_cache(&self) -> Arc<CompletionCache> {
        Arc::clone(&self.cache())
    }

    /// Install settings and host callbacks.
    pub async fn initialize(
        &self,
        settings: PumpSettings,
        on_message: Arc<dyn MessageHandler>,
        on_error: Arc<dyn ErrorHandler>,
        critical: Arc<dyn CriticalError>,
    ) -> Result<(), PumpError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.expect_status("initialize", PumpStatus::Stopped)?;
        settings.validate()?;

        *self.cache() = Arc::new(CompletionCache::new(settings.completion_cache_capacity));
        info!(
            parent: &self.span,
            max_concurrency = settings.max_concurrency,
            prefetch = settings.effective_prefetch(),
            mode = ?settings.transaction_mode,
            "pump initialized"
        );
        lifecycle.settings = settings;
        lifecycle.callbacks = Some(Callbacks {
            on_message,
            on_error,
            critical,
        });
        Ok(())
    }

    /// Open the receiver and start the workers.
    pub async fn start_receive(&self) -> Result<(), PumpError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.expect_status("start receiving", PumpStatus::Stopped)?;
        let callbacks = lifecycle
            .callbacks
            .clone()
            .ok_or(PumpError::NotInitialized)?;
        self.set_status(PumpStatus::Starting);

        let settings = lifecycle.settings.clone();
        let options = ReceiverOptions {
            receive_mode: settings.transaction_mode.receive_mode(),
            prefetch_count: settings.effective_prefetch(),
        };
        let receiver = match self
            .client
            .create_receiver(&self.entity_path, options)
            .instrument(self.span.clone())
            .await
        {
            Ok(receiver) => receiver,
            Err(err) => {
                self.set_status(PumpStatus::Stopped);
                return Err(err.into());
            }
        };

        let control = Arc::new(ConcurrencyControl::new(
            Arc::clone(&receiver),
            settings.clone(),
        ));
        let stop = CancellationToken::new();
        let cancel = CancellationToken::new();
        let breaker = CircuitBreaker::new(
            format!("receiving from '{}'", self.entity_path),
            settings.time_to_wait_before_triggering,
            Arc::clone(&callbacks.critical),
        )
        .with_failure_delay(settings.failure_delay)
        .with_throttle(Arc::clone(&control) as Arc<dyn Throttle>)
        .with_cancellation(cancel.clone())
        .with_span(self.span.clone());

        let shared = Arc::new(PumpShared {
            entity_path: self.entity_path.clone(),
            client: Arc::clone(&self.client),
            receiver,
            mode: settings.transaction_mode,
            receive_wait: settings.receive_wait,
            callbacks,
            completion_cache: self.completion_cache(),
            breaker,
            control,
            stop,
            cancel,
        });
        let mut running = Running {
            shared,
            tracker: TaskTracker::new(),
            workers: 0,
            span: self.span.clone(),
        };
        running.spawn_workers(settings.max_concurrency);
        lifecycle.running = Some(running);

        self.set_status(PumpStatus::Running);
        info!(parent: &self.span, "receiving");
        Ok(())
    }

    /// Apply a new concurrency limit and the matching prefetch without
    /// restarting the receiver.
    pub async fn change_concurrency(&self, max_concurrency: usize) -> Result<(), PumpError> {
        if max_concurrency == 0 {
            return Err(PumpError::Settings(
                "max_concurrency must be at least 1".into(),
            ));
        }
        let mut guard = self.lifecycle.lock().await;
        let lifecycle = &mut *guard;
        lifecycle.settings.max_concurrency = max_concurrency;
        if let Some(running) = lifecycle.running.as_mut() {
            running.shared.control.set_max_concurrency(max_concurrency);
            running.spawn_workers(max_concurrency);
        }
        info!(
            parent: &self.span,
            max_concurrency,
            prefetch = lifecycle.settings.effective_prefetch(),
            "concurrency changed"
        );
        Ok(())
    }

    /// Stop pulling and wait for every in-flight message to be settled.
    ///
    /// Host callbacks see cancellation, but settlement calls do not, so no
    /// accepted message is left unacknowledged. Stopping a stopped pump is a
    /// no-op.
    pub async fn stop_receive(&self) -> Result<(), PumpError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.running.take() else {
            return Ok(());
        };
        self.set_status(PumpStatus::Stopping);
        info!(parent: &self.span, "stopping");

        running.shared.cancel.cancel();
        running.shared.stop.cancel();
        running.tracker.close();
        running.tracker.wait().await;

        if let Err(err) = running.shared.receiver.close().await {
            warn!(parent: &self.span, error = %err, "failed to close receiver");
        }
        self.set_status(PumpStatus::Stopped);
        info!(parent: &self.span, "stopped");
        Ok(())
    }

    fn expect_status(&self, operation: &'static str, expected: PumpStatus) -> Result<(), PumpError> {
        let status = self.status();
        if status != expected {
            return Err(PumpError::InvalidState {
                operation,
                state: status.as_str(),
            });
        }
        Ok(())
    }

    fn set_status(&self, status: PumpStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn cache(&self) -> MutexGuard<'_, Arc<CompletionCache>> {
        self.completion_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().running.take() {
            running.shared.cancel.cancel();
            running.shared.stop.cancel();
            running.tracker.close();
        }
    }
}

async fn run_worker(shared: Arc<PumpShared>, index: usize, mut limit: watch::Receiver<usize>) {
    loop {
        if shared.stop.is_cancelled() {
            break;
        }
        if index >= *limit.borrow_and_update() {
            tokio::select! {
                changed = limit.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shared.stop.cancelled() => break,
            }
            continue;
        }

        let received = tokio::select! {
            received = shared.receiver.receive(shared.receive_wait) => received,
            _ = shared.stop.cancelled() => break,
        };
        match received {
            Ok(Some(message)) => {
                shared.breaker.success();
                shared.process(message).await;
            }
            Ok(None) => shared.breaker.success(),
            Err(err) => {
                warn!(worker = index, error = %err, "failed to receive");
                shared.breaker.failure(err, &shared.stop).await;
            }
        }
    }
    debug!(worker = index, "worker stopped");
}

fn commit_failure(err: TransactionError) -> BrokerError {
    match err {
        TransactionError::Commit { source, .. } => source,
        other => BrokerError::Other(other.to_string()),
    }
}

impl PumpShared {
    async fn process(&self, message: ReceivedMessage) {
        let Some(message_id) = message.message_id.clone() else {
            self.reject(&message, MISSING_ID_REASON, "the message has no native id")
                .await;
            return;
        };
        debug!(message_id = %message_id, delivery_count = message.delivery_count, "received message");

        if self.mode == TransportTransactionMode::ReceiveOnly
            && self.completion_cache.contains(&message_id)
        {
            self.complete_processed(&message, &message_id).await;
            return;
        }

        if self.mode != TransportTransactionMode::None && message.lock_expired(SystemTime::now()) {
            warn!(
                message_id = %message_id,
                "message lock expired before processing started, consider lowering the prefetch count or the concurrency"
            );
            self.safe_abandon(&message).await;
            return;
        }

        let headers = match message.extract_headers() {
            Ok(headers) => headers,
            Err(err) => {
                self.reject(&message, UNREADABLE_REASON, &err.to_string())
                    .await;
                return;
            }
        };

        let context = MessageContext {
            message_id,
            headers,
            body: message.body.clone(),
            receive_address: self.entity_path.clone(),
            binding: self.binding_for(&message),
            native: message,
        };
        self.handle(context).await;
    }

    /// The message was processed before but its completion was lost.
    async fn complete_processed(&self, message: &ReceivedMessage, message_id: &str) {
        match self.receiver.complete(message, None).await {
            Ok(()) => {
                self.completion_cache.remove(message_id);
                debug!(message_id, "completed already processed message");
            }
            Err(err) => {
                self.completion_cache.insert(message_id);
                warn!(message_id, error = %err, "failed to complete already processed message");
            }
        }
    }

    async fn handle(&self, context: MessageContext) {
        let error = match self
            .callbacks
            .on_message
            .handle(&context, self.cancel.clone())
            .await
        {
            Ok(()) => match self.complete_and_commit(&context.native, &context.binding).await {
                Ok(()) => {
                    debug!(message_id = %context.message_id, "message processed");
                    return;
                }
                Err(err)
                    if self.mode == TransportTransactionMode::ReceiveOnly && err.is_lock_lost() =>
                {
                    self.completion_cache.insert(context.message_id.clone());
                    warn!(
                        message_id = %context.message_id,
                        "lock lost while completing a processed message, it will be completed on redelivery"
                    );
                    return;
                }
                Err(err) => HandlerError::Broker(err),
            },
            Err(err) => err,
        };
        context.binding.rollback();

        if error.is_cancelled() {
            debug!(message_id = %context.message_id, "processing cancelled, abandoning message");
            self.safe_abandon(&context.native).await;
            return;
        }
        self.handle_error(context, error).await;
    }

    async fn handle_error(&self, context: MessageContext, error: HandlerError) {
        debug!(message_id = %context.message_id, error = %error, "handler failed, running error handler");
        let binding = self.binding_for(&context.native);
        let context = ErrorContext {
            error,
            message: context.rebind(binding),
        };

        let outcome = self.run_error_handler(&context).await;
        if outcome.is_err() {
            context.message.binding.rollback();
        }

        let message = &context.message.native;
        match outcome {
            Ok(ErrorHandleResult::Handled) => {
                debug!(message_id = %context.message.message_id, "failure handled, message completed");
            }
            Ok(ErrorHandleResult::RetryRequired) => self.safe_abandon(message).await,
            Err(err) if err.is_cancelled() => self.safe_abandon(message).await,
            Err(err)
                if err
                    .broker_error()
                    .is_some_and(|e| e.is_transient() || e.is_lock_lost()) =>
            {
                debug!(error = %err, "error handling failed on a recoverable broker error");
                self.safe_abandon(message).await;
            }
            Err(err) => {
                let description = format!(
                    "failed to execute the recoverability policy for message with native id '{}'",
                    context.message.message_id
                );
                self.callbacks
                    .critical
                    .raise(&description, &err, self.cancel.clone())
                    .await;
                self.safe_abandon(message).await;
            }
        }
    }

    async fn run_error_handler(
        &self,
        context: &ErrorContext,
    ) -> Result<ErrorHandleResult, HandlerError> {
        let result = self
            .callbacks
            .on_error
            .handle(context, self.cancel.clone())
            .await?;
        let binding = &context.message.binding;
        if result == ErrorHandleResult::Handled {
            self.safe_complete(&context.message.native, binding).await?;
        }
        binding.commit().map_err(commit_failure)?;
        Ok(result)
    }

    async fn complete_and_commit(
        &self,
        message: &ReceivedMessage,
        binding: &TransactionBinding,
    ) -> Result<(), BrokerError> {
        self.safe_complete(message, binding).await?;
        binding.commit().map_err(commit_failure)
    }

    /// Complete inside the binding's transaction, if any.
    async fn safe_complete(
        &self,
        message: &ReceivedMessage,
        binding: &TransactionBinding,
    ) -> Result<(), BrokerError> {
        if self.mode == TransportTransactionMode::None {
            return Ok(());
        }
        let scope = binding.scope();
        self.receiver
            .complete(message, scope.as_ref().map(TransactionScope::transaction))
            .await?;
        if let Some(scope) = scope {
            scope.complete();
        }
        Ok(())
    }

    /// Abandon, swallowing lock loss: the message reappears either way.
    async fn safe_abandon(&self, message: &ReceivedMessage) {
        if self.mode == TransportTransactionMode::None {
            return;
        }
        match self.receiver.abandon(message).await {
            Ok(()) => {}
            Err(err) if err.is_lock_lost() => {
                debug!(message_id = ?message.message_id, "lock lost while abandoning");
            }
            Err(err) => {
                warn!(message_id = ?message.message_id, error = %err, "failed to abandon message");
            }
        }
    }

    /// Dead-letter a message that can never be processed.
    async fn reject(&self, message: &ReceivedMessage, reason: &str, description: &str) {
        if self.mode == TransportTransactionMode::None {
            warn!(reason, description, "discarding message that cannot be processed");
            return;
        }
        match self.receiver.dead_letter(message, reason, description).await {
            Ok(()) => warn!(reason, description, "moved message to the dead-letter queue"),
            Err(err) => warn!(reason, error = %err, "failed to dead-letter message"),
        }
    }

    fn binding_for(&self, message: &ReceivedMessage) -> TransactionBinding {
        match self.mode {
            TransportTransactionMode::SendsAtomicWithReceive => TransactionBinding::transactional(
                Transaction::new(message.partition_key.clone()),
                Arc::clone(&self.client),
            ),
            _ => TransactionBinding::none(),
        }
    }
}
