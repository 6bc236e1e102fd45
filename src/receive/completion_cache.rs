//! Bounded record of messages processed but maybe not yet completed.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;

pub const DEFAULT_COMPLETION_CACHE_CAPACITY: usize = 1000;

/// Message ids whose completion may not have reached the broker.
///
/// A redelivered message found here was already handled, so it is completed
/// without running the handler again. Eviction only costs one redundant
/// handler invocation.
pub struct CompletionCache {
    entries: Mutex<LruCache<String, ()>>,
}

impl Default for CompletionCache {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETION_CACHE_CAPACITY)
    }
}

impl CompletionCache {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn insert(&self, message_id: impl Into<String>) {
        self.entries().put(message_id.into(), ());
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries().contains(message_id)
    }

    pub fn remove(&self, message_id: &str) -> bool {
        self.entries().pop(message_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<String, ()>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
