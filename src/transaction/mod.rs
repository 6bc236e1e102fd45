//! Transactions that tie outgoing sends to the processing of a received message.

mod binding;
mod transaction;

pub use binding::TransactionBinding;
pub use transaction::{Enlistment, Transaction, TransactionScope, TransactionStatus};
