//! Error types for publish/subscribe operations.

use thiserror::Error;

/// Failure to convert a payload to or from its wire form.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON encoding or decoding failed
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary encoding or decoding failed
    #[error("binary codec error: {0}")]
    Binary(#[from] bincode::Error),
}

/// Error that can occur while talking to the broker.
///
/// Variants split into two groups:
/// - **Setup** (`Connection`, `Channel`, `Topology`, `Subscribe`): returned to
///   the caller, the operation is aborted.
/// - **Steady state** (`Decode`, `Ack`): raised inside a subscription loop,
///   logged and contained there.
///
/// `Encode`, `Publish` and `Timeout` belong to a single publish call and are
/// returned to its caller.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Broker unreachable or the connection was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// Channel could not be opened or was closed
    #[error("channel error: {0}")]
    Channel(String),

    /// Exchange/queue declaration or binding rejected by the broker
    #[error("topology error for '{queue}': {reason}")]
    Topology { queue: String, reason: String },

    /// Value could not be serialized, nothing was sent
    #[error("encode error: {0}")]
    Encode(#[source] CodecError),

    /// Delivery payload did not match the expected type
    #[error("decode error: {0}")]
    Decode(#[source] CodecError),

    /// Broker rejected the send
    #[error("publish error: {0}")]
    Publish(String),

    /// Delivery stream could not be acquired
    #[error("subscribe error: {0}")]
    Subscribe(String),

    /// Broker rejected an ack or nack
    #[error("ack error: {0}")]
    Ack(String),

    /// Operation exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),
}

impl PubSubError {
    /// Create a topology error.
    pub fn topology(queue: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Topology {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a connection error from any displayable cause.
    pub fn connection(error: impl std::fmt::Display) -> Self {
        Self::Connection(error.to_string())
    }

    /// Create a channel error from any displayable cause.
    pub fn channel(error: impl std::fmt::Display) -> Self {
        Self::Channel(error.to_string())
    }

    /// Create a publish error from any displayable cause.
    pub fn publish(error: impl std::fmt::Display) -> Self {
        Self::Publish(error.to_string())
    }

    /// Create a subscribe error from any displayable cause.
    pub fn subscribe(error: impl std::fmt::Display) -> Self {
        Self::Subscribe(error.to_string())
    }

    /// Create an ack error from any displayable cause.
    pub fn ack(error: impl std::fmt::Display) -> Self {
        Self::Ack(error.to_string())
    }

    /// Whether this error aborts setup (connect, declare, bind, consume).
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            PubSubError::Connection(_)
                | PubSubError::Channel(_)
                | PubSubError::Topology { .. }
                | PubSubError::Subscribe(_)
        )
    }
}

/// Result alias used across the crate.
pub type PubSubResult<T> = Result<T, PubSubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_failures() {
        assert!(PubSubError::connection("refused").is_setup_failure());
        assert!(PubSubError::channel("closed").is_setup_failure());
        assert!(PubSubError::topology("q", "PRECONDITION_FAILED").is_setup_failure());
        assert!(PubSubError::subscribe("no queue").is_setup_failure());

        assert!(!PubSubError::publish("rejected").is_setup_failure());
        assert!(!PubSubError::ack("channel closed").is_setup_failure());
    }

    #[test]
    fn test_decode_error_keeps_codec_source() {
        use std::error::Error as _;

        let decode = PubSubError::Decode(CodecError::Json(
            serde_json::from_str::<u32>("nope").unwrap_err(),
        ));
        assert!(decode.to_string().starts_with("decode error: json codec error"));
        assert!(decode.source().is_some());
        assert!(!decode.is_setup_failure());
    }

    #[test]
    fn test_topology_error_message() {
        let err = PubSubError::topology("pause.alice", "inequivalent arg 'durable'");
        let message = err.to_string();
        assert!(message.contains("pause.alice"));
        assert!(message.contains("durable"));
    }
}
