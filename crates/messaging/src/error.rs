use thiserror::Error;

use crate::MessageId;

/// Errors surfaced by the messaging layer.
///
/// Every variant carries owned strings rather than source errors so that a
/// single failed connection attempt can be cloned out to all callers that
/// were waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessagingError {
    /// The broker could not be reached or refused the connection.
    #[error("Broker unavailable: {0}")]
    ResourceUnavailable(String),

    /// A mandatory message matched no queue and was returned by the broker.
    #[error(
        "Unroutable message {message_id}: exchange={exchange} routing_key={routing_key} ({reply_code} {reply_text})"
    )]
    Unroutable {
        message_id: MessageId,
        exchange: String,
        routing_key: String,
        reply_code: u16,
        reply_text: String,
    },

    /// The broker negatively acknowledged the message.
    #[error("Broker rejected message {message_id}")]
    Rejected { message_id: MessageId },

    /// The connection or channel was lost before the outcome was known.
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    /// An inbound payload could not be decoded or failed validation.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A message with the same identifier is already awaiting confirmation.
    #[error("Message {0} is already awaiting confirmation")]
    DuplicateInFlight(MessageId),

    /// Declaring or using exchanges, queues or bindings failed.
    #[error("Topology error: {0}")]
    Topology(String),

    /// A channel level operation failed.
    #[error("Channel error: {0}")]
    Channel(String),

    /// An outbound payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification used for logging, metrics and API status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ResourceUnavailable,
    Unroutable,
    Rejected,
    ConnectionReset,
    MalformedMessage,
    Internal,
}

impl ErrorKind {
    /// Returns the label used in metrics and error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::Unroutable => "unroutable",
            ErrorKind::Rejected => "rejected",
            ErrorKind::ConnectionReset => "connection_reset",
            ErrorKind::MalformedMessage => "malformed_message",
            ErrorKind::Internal => "internal",
        }
    }
}

impl MessagingError {
    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessagingError::ResourceUnavailable(_) | MessagingError::Channel(_) => {
                ErrorKind::ResourceUnavailable
            }
            MessagingError::Unroutable { .. } => ErrorKind::Unroutable,
            MessagingError::Rejected { .. } => ErrorKind::Rejected,
            MessagingError::ConnectionReset(_) => ErrorKind::ConnectionReset,
            MessagingError::MalformedMessage(_) => ErrorKind::MalformedMessage,
            MessagingError::DuplicateInFlight(_)
            | MessagingError::Topology(_)
            | MessagingError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceUnavailable | ErrorKind::ConnectionReset
        )
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Serialization(err.to_string())
    }
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
