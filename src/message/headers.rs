//! Application-level header names the transport reads or writes.

pub const MESSAGE_ID: &str = "MessageId";
pub const CORRELATION_ID: &str = "CorrelationId";
pub const CONTENT_TYPE: &str = "ContentType";
pub const REPLY_TO_ADDRESS: &str = "ReplyToAddress";
/// Time to be received, formatted as whole seconds.
pub const TIME_TO_BE_RECEIVED: &str = "TimeToBeReceived";
/// Semicolon separated list of the message types carried in the body.
pub const ENCLOSED_MESSAGE_TYPES: &str = "EnclosedMessageTypes";
