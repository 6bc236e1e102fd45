//! Broker-compatible cross-entity transaction.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{BrokerError, TransactionError};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// A resource that takes part in a transaction.
///
/// Broker clients enlist staged work (sends, completions) and apply it only
/// when the owning unit of work commits.
pub trait Enlistment: Send + Sync {
    fn commit(&self) -> Result<(), BrokerError>;
    fn rollback(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

struct TransactionState {
    status: TransactionStatus,
    doomed: bool,
    enlistments: Vec<Box<dyn Enlistment>>,
}

struct TransactionInner {
    id: String,
    partition_key: Option<String>,
    state: Mutex<TransactionState>,
}

/// An ambient transaction spanning one unit of work.
///
/// Cheap to clone; clones share the same state. Only the owner of the unit of
/// work calls `commit`. Participants work through a `TransactionScope`.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    /// Start a new transaction, optionally pinned to a partition.
    pub fn new(partition_key: Option<String>) -> Self {
        let id = format!("txn-{}", NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(TransactionInner {
                id,
                partition_key,
                state: Mutex::new(TransactionState {
                    status: TransactionStatus::Active,
                    doomed: false,
                    enlistments: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.inner.partition_key.as_deref()
    }

    pub fn status(&self) -> TransactionStatus {
        self.state().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// Whether an incomplete scope has forced this transaction to roll back.
    pub fn is_doomed(&self) -> bool {
        self.state().doomed
    }

    /// Register staged work to be applied on commit.
    pub fn enlist(&self, enlistment: Box<dyn Enlistment>) -> Result<(), TransactionError> {
        let mut state = self.state();
        if state.status != TransactionStatus::Active {
            return Err(TransactionError::NotActive(self.inner.id.clone()));
        }
        state.enlistments.push(enlistment);
        Ok(())
    }

    /// Open a participant scope bound to this transaction.
    pub fn scope(&self) -> TransactionScope {
        TransactionScope {
            transaction: self.clone(),
            completed: false,
        }
    }

    /// Apply every enlistment. A doomed transaction rolls back instead.
    pub fn commit(&self) -> Result<(), TransactionError> {
        let (doomed, enlistments) = {
            let mut state = self.state();
            if state.status != TransactionStatus::Active {
                return Err(TransactionError::NotActive(self.inner.id.clone()));
            }
            let doomed = state.doomed;
            state.status = if doomed {
                TransactionStatus::RolledBack
            } else {
                TransactionStatus::Committed
            };
            (doomed, std::mem::take(&mut state.enlistments))
        };

        if doomed {
            for enlistment in &enlistments {
                enlistment.rollback();
            }
            return Err(TransactionError::Doomed(self.inner.id.clone()));
        }

        for (index, enlistment) in enlistments.iter().enumerate() {
            if let Err(source) = enlistment.commit() {
                for rest in &enlistments[index + 1..] {
                    rest.rollback();
                }
                self.state().status = TransactionStatus::RolledBack;
                return Err(TransactionError::Commit {
                    id: self.inner.id.clone(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Discard every enlistment. Calling it on a finished transaction is a no-op.
    pub fn rollback(&self) {
        let enlistments = {
            let mut state = self.state();
            if state.status != TransactionStatus::Active {
                return;
            }
            state.status = TransactionStatus::RolledBack;
            std::mem::take(&mut state.enlistments)
        };
        for enlistment in &enlistments {
            enlistment.rollback();
        }
    }

    fn doom(&self) {
        self.state().doomed = true;
    }

    fn state(&self) -> MutexGuard<'_, TransactionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("partition_key", &self.inner.partition_key)
            .field("status", &state.status)
            .field("doomed", &state.doomed)
            .field("enlistments", &state.enlistments.len())
            .finish()
    }
}

/// A participant's view of the ambient transaction.
///
/// `complete` marks this participant's portion as done. Dropping a scope that
/// was never completed dooms the transaction. A scope never commits the
/// transaction itself.
#[must_use = "an incomplete scope dooms the ambient transaction when dropped"]
pub struct TransactionScope {
    transaction: Transaction,
    completed: bool,
}

impl TransactionScope {
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if !self.completed {
            self.transaction.doom();
        }
    }
}
