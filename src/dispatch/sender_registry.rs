//! One cached sender per (destination, connection).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::sync::OnceCell;
use tracing::{debug, warn, Span};

use crate::client::{BrokerClient, BrokerSender};
use crate::error::{BrokerError, CloseError};

type SenderKey = (String, String);
type SenderSlot = Arc<OnceCell<Arc<dyn BrokerSender>>>;

/// Lazily creates and caches broker senders.
///
/// Concurrent first callers for the same key share one creation; a failed
/// creation leaves the slot empty so the next caller retries.
pub struct SenderRegistry {
    senders: Mutex<HashMap<SenderKey, SenderSlot>>,
    span: Span,
}

impl Default for SenderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            span: tracing::info_span!("sender_registry"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Get the sender for `destination` on `client`, creating it on first use.
    pub async fn get_sender(
        &self,
        destination: &str,
        client: &dyn BrokerClient,
    ) -> Result<Arc<dyn BrokerSender>, BrokerError> {
        let slot = Arc::clone(
            self.slots()
                .entry((destination.to_string(), client.identifier().to_string()))
                .or_default(),
        );
        let sender = slot
            .get_or_try_init(|| async {
                debug!(parent: &self.span, destination, connection = client.identifier(), "creating sender");
                client.create_sender(destination).await
            })
            .await?;
        Ok(Arc::clone(sender))
    }

    /// Number of senders actually created.
    pub fn len(&self) -> usize {
        self.slots().values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every created sender concurrently and forget all of them.
    pub async fn close_all(&self) -> Result<(), CloseError> {
        let senders: Vec<Arc<dyn BrokerSender>> = self
            .slots()
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();

        let results = join_all(senders.iter().map(|sender| async move {
            (sender.destination().to_string(), sender.close().await)
        }))
        .await;

        let failures: Vec<(String, BrokerError)> = results
            .into_iter()
            .filter_map(|(destination, result)| result.err().map(|err| (destination, err)))
            .collect();
        if failures.is_empty() {
            debug!(parent: &self.span, closed = senders.len(), "closed senders");
            return Ok(());
        }
        for (destination, err) in &failures {
            warn!(parent: &self.span, destination = %destination, error = %err, "failed to close sender");
        }
        Err(CloseError { failures })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SenderKey, SenderSlot>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
