//! Failure-rate circuit breaker for the receive loop.
//!
//! The first failure after a healthy period arms a one-shot timer. If
//! failures are still being reported when it fires, the breaker throttles
//! the pump and raises a critical error. The next success disarms the timer
//! and lifts the throttle.
//!
//! Arming, disarming, and triggering all happen under one lock. Each arm
//! gets a new generation, so a timer that already woke up cannot trigger
//! after a success has disarmed it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument, Span};

use super::context::CriticalError;
use crate::error::BrokerError;

pub const DEFAULT_TIME_TO_WAIT_BEFORE_TRIGGERING: Duration = Duration::from_secs(120);
pub const DEFAULT_FAILURE_DELAY: Duration = Duration::from_secs(1);

/// Something the breaker slows down while it is triggered.
pub trait Throttle: Send + Sync {
    fn throttle(&self);
    fn restore(&self);
}

#[derive(Default)]
struct BreakerState {
    failures: usize,
    triggered: bool,
    /// Bumped on every arm and every disarm
    generation: u64,
    timer: Option<JoinHandle<()>>,
    last_error: Option<BrokerError>,
}

type SharedState = Arc<Mutex<BreakerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, BreakerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CircuitBreaker {
    name: String,
    time_to_wait: Duration,
    failure_delay: Duration,
    state: SharedState,
    critical: Arc<dyn CriticalError>,
    throttle: Option<Arc<dyn Throttle>>,
    cancel: CancellationToken,
    span: Span,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        time_to_wait: Duration,
        critical: Arc<dyn CriticalError>,
    ) -> Self {
        let name = name.into();
        Self {
            span: tracing::info_span!("circuit_breaker", name = %name),
            name,
            time_to_wait,
            failure_delay: DEFAULT_FAILURE_DELAY,
            state: Arc::new(Mutex::new(BreakerState::default())),
            critical,
            throttle: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_failure_delay(mut self, delay: Duration) -> Self {
        self.failure_delay = delay;
        self
    }

    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Token handed to the critical error callback.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn failure_count(&self) -> usize {
        lock(&self.state).failures
    }

    pub fn is_triggered(&self) -> bool {
        lock(&self.state).triggered
    }

    /// Record a healthy operation. Disarms the breaker and lifts the
    /// throttle if it was triggered.
    pub fn success(&self) {
        let mut state = lock(&self.state);
        if state.failures == 0 && !state.triggered {
            return;
        }
        state.failures = 0;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.triggered {
            state.triggered = false;
            if let Some(throttle) = &self.throttle {
                throttle.restore();
            }
            info!(parent: &self.span, "recovered, full concurrency restored");
        }
    }

    /// Record a failure, then pause briefly unless `cancel` fires first.
    pub async fn failure(&self, err: BrokerError, cancel: &CancellationToken) {
        {
            let mut state = lock(&self.state);
            state.last_error = Some(err);
            state.failures += 1;
            if state.failures == 1 && !state.triggered {
                self.arm(&mut state);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(self.failure_delay) => {}
            _ = cancel.cancelled() => {}
        }
    }

    fn arm(&self, state: &mut BreakerState) {
        state.generation += 1;
        let generation = state.generation;
        let time_to_wait = self.time_to_wait;
        let shared = Arc::clone(&self.state);
        let critical = Arc::clone(&self.critical);
        let throttle = self.throttle.clone();
        let cancel = self.cancel.clone();
        let description = format!(
            "'{}' kept failing for {:?}",
            self.name, self.time_to_wait
        );

        let timer = tokio::spawn(
            async move {
                tokio::time::sleep(time_to_wait).await;
                let err = {
                    let mut state = lock(&shared);
                    if state.generation != generation || state.failures == 0 || state.triggered {
                        return;
                    }
                    state.triggered = true;
                    state.timer = None;
                    // Throttle under the lock so a concurrent success restores after it.
                    if let Some(throttle) = &throttle {
                        throttle.throttle();
                    }
                    state
                        .last_error
                        .clone()
                        .unwrap_or_else(|| BrokerError::Other("unknown failure".into()))
                };

                error!(error = %err, "circuit breaker triggered, throttling to one concurrent message");
                critical.raise(&description, &err, cancel).await;
            }
            .instrument(self.span.clone()),
        );

        if let Some(previous) = state.timer.replace(timer) {
            previous.abort();
        }
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.state).timer.take() {
            timer.abort();
        }
    }
}
