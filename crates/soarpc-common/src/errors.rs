//! Transport and serialization error taxonomy.
//!
//! All variants carry owned strings rather than source errors so that they
//! are `Clone`: the client engine caches call outcomes inside futures and
//! re-yields them on subsequent result retrievals.

use thiserror::Error;

/// A structurally invalid message was produced or encountered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed message: {0}")]
pub struct MalformedMessage(pub String);

/// Body encoding or decoding failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    #[error("cannot serialize message: {0}")]
    Serialize(String),
    #[error("cannot deserialize message: {0}")]
    Deserialize(String),
}

/// Failures raised by a transport while moving messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The body could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// A broker connection could not be obtained.
    #[error("cannot get connection: {0}")]
    Connection(String),

    /// The serialized message exceeds the configured maximum.
    #[error("message of {size} bytes exceeds the maximum of {maximum} bytes")]
    MessageTooLarge { size: usize, maximum: usize },

    /// The destination queue stayed at capacity through every retry.
    #[error("queue {queue} was full after {retries} retries")]
    QueueFull { queue: String, retries: u32 },

    /// The broker rejected or failed the send for another reason.
    #[error("error sending message: {0}")]
    SendFailure(String),

    #[error("timed out sending message")]
    SendTimeout,

    /// Receiving failed mid-message (for example, a chunk gap).
    #[error("error receiving message: {0}")]
    ReceiveFailure(String),

    /// No message arrived within the receive deadline.
    #[error("timed out waiting to receive a message")]
    ReceiveTimeout,

    /// The message was structurally invalid (bad envelope, bad headers).
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl TransportError {
    /// Whether this failure is typically transient and unrelated to the
    /// message contents. The server run loop backs off and continues on
    /// transient failures; anything else is a programming error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_)
                | TransportError::QueueFull { .. }
                | TransportError::SendFailure(_)
                | TransportError::SendTimeout
                | TransportError::ReceiveFailure(_)
                | TransportError::ReceiveTimeout
        )
    }

    pub fn is_receive_timeout(&self) -> bool {
        matches!(self, TransportError::ReceiveTimeout)
    }
}

impl From<MalformedMessage> for TransportError {
    fn from(err: MalformedMessage) -> Self {
        TransportError::InvalidMessage(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_split() {
        assert!(TransportError::ReceiveTimeout.is_transient());
        assert!(TransportError::Connection("down".to_owned()).is_transient());
        assert!(!TransportError::MessageTooLarge { size: 10, maximum: 5 }.is_transient());
        assert!(!TransportError::InvalidMessage("bad".to_owned()).is_transient());
        assert!(
            !TransportError::Serialization(SerializationError::Serialize("x".to_owned()))
                .is_transient()
        );
    }
}
