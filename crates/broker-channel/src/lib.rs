//! # Broker Channel
//!
//! Connection and channel contracts for AMQP-style brokers, consumed by the
//! listener runtime, together with an in-memory broker implementation.
//!
//! This library provides:
//! - Provider-agnostic connection and channel traits
//! - Delivery and property types with dead-letter history
//! - A consumer event stream carrying deliveries and lifecycle confirmations
//! - An in-memory broker for unit tests and development
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for channel and connection operations
//! - [`message`] - Delivery structures and domain identifiers
//! - [`channel`] - Connection, channel, and consumer event contracts
//! - [`memory`] - In-memory broker implementation

// Module declarations
pub mod channel;
pub mod error;
pub mod memory;
pub mod message;

// Re-export commonly used types at crate root for convenience
pub use channel::{
    Channel, Connection, ConnectionProvider, ConsumeOptions, ConsumerEvent, Subscription,
};
pub use error::{ChannelError, ValidationError};
pub use memory::InMemoryBroker;
pub use message::{
    DeathRecord, Delivery, DeliveryProperties, QueueInfo, QueueName, Timestamp,
};
