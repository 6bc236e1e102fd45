use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Broker limit on messages enlisted in one transaction.
pub const DEFAULT_MAX_MESSAGES_PER_TRANSACTION: usize = 100;

/// Dispatcher settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Most batchable messages a single ambient transaction may carry
    pub max_messages_per_transaction: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_messages_per_transaction: DEFAULT_MAX_MESSAGES_PER_TRANSACTION,
        }
    }
}

impl DispatchSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_max_messages_per_transaction(mut self, max: usize) -> Self {
        self.max_messages_per_transaction = max;
        self
    }

    pub(crate) fn check_transaction_limit(&self, count: usize) -> Result<(), DispatchError> {
        if count > self.max_messages_per_transaction {
            return Err(DispatchError::TransactionLimitExceeded {
                count,
                limit: self.max_messages_per_transaction,
            });
        }
        Ok(())
    }
}
