//! Per-unit-of-work binding between sends and the ambient transaction.

use std::fmt;
use std::sync::Arc;

use crate::client::BrokerClient;

use super::transaction::{Transaction, TransactionScope};

/// Everything a unit of work needs to send inside (or outside) a transaction.
///
/// Built once when the unit of work starts: the connection to send through,
/// the partition key every outgoing message is pinned to, and the ambient
/// transaction. Never shared between concurrently processed messages.
#[derive(Clone, Default)]
pub struct TransactionBinding {
    connection: Option<Arc<dyn BrokerClient>>,
    partition_key: Option<String>,
    transaction: Option<Transaction>,
}

impl TransactionBinding {
    /// A binding with no transaction, connection override, or partition key.
    pub fn none() -> Self {
        Self::default()
    }

    /// Bind to a transaction that must go through the given connection.
    ///
    /// The partition key is taken from the transaction.
    pub fn transactional(transaction: Transaction, connection: Arc<dyn BrokerClient>) -> Self {
        Self {
            partition_key: transaction.partition_key().map(str::to_string),
            connection: Some(connection),
            transaction: Some(transaction),
        }
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn with_connection(mut self, connection: Arc<dyn BrokerClient>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn connection(&self) -> Option<&Arc<dyn BrokerClient>> {
        self.connection.as_ref()
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// The transaction, if one is bound and still active.
    pub fn active_transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref().filter(|txn| txn.is_active())
    }

    pub fn has_active_transaction(&self) -> bool {
        self.active_transaction().is_some()
    }

    /// Open a participant scope on the active transaction, if any.
    pub fn scope(&self) -> Option<TransactionScope> {
        self.active_transaction().map(Transaction::scope)
    }

    /// Commit the bound transaction. Without one this is a no-op.
    pub fn commit(&self) -> Result<(), crate::error::TransactionError> {
        match &self.transaction {
            Some(txn) => txn.commit(),
            None => Ok(()),
        }
    }

    /// Roll back the bound transaction, if any.
    pub fn rollback(&self) {
        if let Some(txn) = &self.transaction {
            txn.rollback();
        }
    }
}

impl fmt::Debug for TransactionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionBinding")
            .field(
                "connection",
                &self.connection.as_ref().map(|c| c.identifier().to_string()),
            )
            .field("partition_key", &self.partition_key)
            .field("transaction", &self.transaction)
            .finish()
    }
}
