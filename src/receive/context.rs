//! What the pump hands to host callbacks, and the callback seams themselves.

use std::collections::HashMap;
use std::error::Error;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::message::ReceivedMessage;
use crate::transaction::TransactionBinding;

/// One received message, ready for the host's handler.
#[derive(Clone, Debug)]
pub struct MessageContext {
    pub message_id: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Queue or subscription the message was received from
    pub receive_address: String,
    /// Sends made through this binding take part in the message's transaction
    pub binding: TransactionBinding,
    pub native: ReceivedMessage,
}

impl MessageContext {
    pub fn delivery_count(&self) -> u32 {
        self.native.delivery_count
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub(crate) fn rebind(mut self, binding: TransactionBinding) -> Self {
        self.binding = binding;
        self
    }
}

/// A handler failure, handed to the error callback.
#[derive(Debug)]
pub struct ErrorContext {
    pub error: HandlerError,
    /// The failed message, bound to a fresh transaction
    pub message: MessageContext,
}

impl ErrorContext {
    pub fn delivery_attempts(&self) -> u32 {
        self.message.delivery_count()
    }
}

/// Verdict of the error callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorHandleResult {
    /// The failure was dealt with; complete the message.
    Handled,
    /// Abandon the message so the broker redelivers it.
    RetryRequired,
}

/// Processes one message. Returning an error hands it to the error callback.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        context: &MessageContext,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Retry and recoverability policy for failed messages.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(
        &self,
        context: &ErrorContext,
        cancel: CancellationToken,
    ) -> Result<ErrorHandleResult, HandlerError>;
}

/// Receives faults the transport cannot resolve on its own.
///
/// The host decides whether to shut the endpoint down.
#[async_trait]
pub trait CriticalError: Send + Sync {
    async fn raise(
        &self,
        description: &str,
        error: &(dyn Error + Send + Sync),
        cancel: CancellationToken,
    );
}

/// Logs critical errors and takes no further action.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogCriticalError;

#[async_trait]
impl CriticalError for LogCriticalError {
    async fn raise(
        &self,
        description: &str,
        error: &(dyn Error + Send + Sync),
        _cancel: CancellationToken,
    ) {
        tracing::error!(error = %error, "{}", description);
    }
}
