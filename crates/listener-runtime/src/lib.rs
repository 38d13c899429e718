//! # Listener Runtime
//!
//! Consumer-management engine for AMQP-style brokers: maintains long-running
//! consumers per queue, dispatches deliveries to an application handler, and
//! manages acknowledgment batching, error classification, and failure
//! recovery.
//!
//! This library provides:
//! - A listener container owning queue membership and consumer lifecycle
//! - Per-consumer deferred acknowledgment with cumulative flushing
//! - A recovery monitor that detects and repairs broken consumers
//! - Error classification with dead-letter loop protection
//!
//! ## Module Organization
//!
//! - [`config`] - Container configuration surface
//! - [`error`] - Listener and handler error types
//! - [`classifier`] - Fatal-exception strategy and delivery outcomes
//! - [`handler`] - Application handler contract and manual acknowledgment
//! - [`ack`] - Acknowledgment batching
//! - [`consumer`] - Single-queue consumer lifecycle
//! - [`container`] - Container controller
//! - [`retry`] - Recovery backoff policy
//!
//! The broker boundary (connections, channels, deliveries) lives in the
//! `broker-channel` crate; the engine never touches the wire protocol.

// Module declarations
pub mod ack;
pub mod classifier;
pub mod config;
pub mod consumer;
pub mod container;
pub mod error;
pub mod handler;
pub(crate) mod monitor;
pub mod retry;

// Re-export commonly used types at crate root for convenience
pub use ack::AckBatcher;
pub use classifier::{
    ConditionalRejectingClassifier, DefaultFatalExceptionStrategy, DeliveryOutcome,
    FatalExceptionStrategy,
};
pub use config::{AcknowledgeMode, ContainerConfig};
pub use consumer::ConsumerState;
pub use container::{ContainerLifecycle, MessageListenerContainer};
pub use error::{HandlerError, ListenerError};
pub use handler::{ManualAckHandle, MessageHandler};
pub use retry::RecoveryPolicy;
