use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::circuit_breaker::{DEFAULT_FAILURE_DELAY, DEFAULT_TIME_TO_WAIT_BEFORE_TRIGGERING};
use super::completion_cache::DEFAULT_COMPLETION_CACHE_CAPACITY;
use crate::client::ReceiveMode;
use crate::error::PumpError;

pub const DEFAULT_PREFETCH_MULTIPLIER: u32 = 10;
pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(5);

/// How receive settlement and outgoing sends relate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportTransactionMode {
    /// Messages are deleted on receipt. Nothing is completed or abandoned.
    None,
    /// Messages are locked and completed after processing. Sends are not
    /// tied to the completion.
    ReceiveOnly,
    /// Sends made while processing commit atomically with the completion.
    #[default]
    SendsAtomicWithReceive,
}

impl TransportTransactionMode {
    pub fn receive_mode(self) -> ReceiveMode {
        match self {
            TransportTransactionMode::None => ReceiveMode::ReceiveAndDelete,
            _ => ReceiveMode::PeekLock,
        }
    }
}

fn default_max_concurrency() -> usize {
    std::thread::available_parallelism().map_or(2, |n| n.get().max(2))
}

/// Receive pump settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    /// Messages processed at the same time
    pub max_concurrency: usize,
    /// Prefetch per concurrent message when no explicit count is set
    pub prefetch_multiplier: u32,
    /// Explicit prefetch count. Zero disables prefetching.
    pub prefetch_count: Option<u32>,
    pub transaction_mode: TransportTransactionMode,
    /// Longest single wait for a message
    pub receive_wait: Duration,
    /// Sustained receive failures before the critical error is raised
    pub time_to_wait_before_triggering: Duration,
    /// Pause after each receive failure
    pub failure_delay: Duration,
    pub completion_cache_capacity: usize,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            prefetch_multiplier: DEFAULT_PREFETCH_MULTIPLIER,
            prefetch_count: None,
            transaction_mode: TransportTransactionMode::default(),
            receive_wait: DEFAULT_RECEIVE_WAIT,
            time_to_wait_before_triggering: DEFAULT_TIME_TO_WAIT_BEFORE_TRIGGERING,
            failure_delay: DEFAULT_FAILURE_DELAY,
            completion_cache_capacity: DEFAULT_COMPLETION_CACHE_CAPACITY,
        }
    }
}

impl PumpSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, PumpError> {
        let settings: PumpSettings =
            serde_json::from_str(json).map_err(|err| PumpError::Settings(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_prefetch_multiplier(mut self, multiplier: u32) -> Self {
        self.prefetch_multiplier = multiplier;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    pub fn with_transaction_mode(mut self, mode: TransportTransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_time_to_wait_before_triggering(mut self, wait: Duration) -> Self {
        self.time_to_wait_before_triggering = wait;
        self
    }

    pub fn with_failure_delay(mut self, delay: Duration) -> Self {
        self.failure_delay = delay;
        self
    }

    pub fn with_completion_cache_capacity(mut self, capacity: usize) -> Self {
        self.completion_cache_capacity = capacity;
        self
    }

    /// Prefetch count for a given concurrency.
    pub fn prefetch_for(&self, max_concurrency: usize) -> u32 {
        self.prefetch_count.unwrap_or_else(|| {
            u32::try_from(max_concurrency)
                .unwrap_or(u32::MAX)
                .saturating_mul(self.prefetch_multiplier)
        })
    }

    /// Prefetch count for the configured concurrency.
    pub fn effective_prefetch(&self) -> u32 {
        self.prefetch_for(self.max_concurrency)
    }

    pub fn validate(&self) -> Result<(), PumpError> {
        if self.max_concurrency == 0 {
            return Err(PumpError::Settings(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.completion_cache_capacity == 0 {
            return Err(PumpError::Settings(
                "completion_cache_capacity must be at least 1".into(),
            ));
        }
        if self.receive_wait.is_zero() {
            return Err(PumpError::Settings("receive_wait must be positive".into()));
        }
        Ok(())
    }
}
