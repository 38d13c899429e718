//! Error types for broker channel operations.

use thiserror::Error;

/// Comprehensive error type for all channel and connection operations
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connection is closed: {message}")]
    ConnectionClosed { message: String },

    #[error("Channel is closed: {message}")]
    ChannelClosed { message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Consumer not found: {consumer_tag}")]
    ConsumerNotFound { consumer_tag: String },

    #[error("Broker refused operation ({code}): {message}")]
    Broker { code: String, message: String },
}

impl ChannelError {
    /// Check if the error is evidence that the channel (or its connection)
    /// is no longer usable and the consumer must be replaced.
    pub fn is_channel_loss(&self) -> bool {
        match self {
            Self::ConnectionClosed { .. } => true,
            Self::ChannelClosed { .. } => true,
            Self::QueueNotFound { .. } => false,
            Self::ConsumerNotFound { .. } => false,
            // A refusal on an ack/nack/cancel typically means the broker has
            // already torn the channel down on its side.
            Self::Broker { .. } => true,
        }
    }

    /// Check if the error is a queue declaration failure, retried on its own
    /// schedule rather than through consumer replacement.
    pub fn is_declaration_failure(&self) -> bool {
        matches!(self, Self::QueueNotFound { .. })
    }
}

/// Validation errors for domain identifiers
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
