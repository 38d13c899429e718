//! Error types for the listener runtime.
//!
//! [`ListenerError`] is the container-facing taxonomy; [`HandlerError`] is
//! what application handlers return, carrying explicit disposition markers
//! instead of control-flow exceptions.

use broker_channel::error::{ChannelError, ValidationError};
use broker_channel::message::QueueName;
use thiserror::Error;

/// Errors surfaced by container operations
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Invalid queue name: {0}")]
    InvalidQueueName(#[from] ValidationError),

    #[error("Container is {state}; operation requires {required}")]
    InvalidLifecycle { state: String, required: String },

    #[error("Declaration of queue '{queue}' failed after {attempts} attempts: {source}")]
    DeclarationFailed {
        queue: QueueName,
        attempts: u32,
        #[source]
        source: ChannelError,
    },

    #[error("Consumers did not report consuming within {timeout_millis}ms")]
    StartTimedOut { timeout_millis: u64 },

    #[error("Channel operation failed: {0}")]
    Channel(#[from] ChannelError),
}

/// Errors returned by application message handlers.
///
/// The variants double as disposition markers consumed by the error
/// classifier: `RejectNoRequeue` and `ImmediateAcknowledge` state the broker
/// disposition directly, `Invocation` wraps a downstream failure one level
/// deep, and the classifier's fatal-exception strategy decides the rest.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Wrapper for a failure raised while invoking the handler target;
    /// the classifier unwraps one level and inspects the inner error
    #[error("listener invocation failed: {source}")]
    Invocation {
        #[source]
        source: Box<HandlerError>,
    },

    /// The payload could not be converted into the handler's input
    #[error("message conversion failed: {reason}")]
    Conversion { reason: String },

    /// Explicit marker: never requeue this delivery
    #[error("rejected without requeue: {reason}")]
    RejectNoRequeue { reason: String },

    /// Explicit marker: acknowledge the delivery despite the failure
    #[error("acknowledge despite failure: {reason}")]
    ImmediateAcknowledge { reason: String },

    /// Any other handler failure; transient by default
    #[error("handler failed: {reason}")]
    Other { reason: String },
}

impl HandlerError {
    /// Convenience constructor for transient failures
    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for conversion failures
    pub fn conversion(reason: impl Into<String>) -> Self {
        Self::Conversion {
            reason: reason.into(),
        }
    }

    /// Wrap a failure in the invocation marker
    pub fn invocation(source: HandlerError) -> Self {
        Self::Invocation {
            source: Box::new(source),
        }
    }

    /// The error after unwrapping at most one invocation wrapper
    pub fn effective(&self) -> &HandlerError {
        match self {
            Self::Invocation { source } => source,
            other => other,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
