//! Connection and channel contracts implemented by broker client layers.
//!
//! The listener runtime consumes these traits only; it never touches the wire
//! protocol. A broker client (or the in-memory broker in [`crate::memory`])
//! implements the three traits and pushes consumer events through the
//! [`Subscription`] event stream returned by `basic_consume`.

use crate::error::ChannelError;
use crate::message::{Delivery, QueueInfo, QueueName};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Supplies broker connections to the listener runtime
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Open a new broker connection
    async fn create_connection(&self) -> Result<std::sync::Arc<dyn Connection>, ChannelError>;
}

/// An open broker connection capable of creating channels
#[async_trait]
pub trait Connection: Send + Sync {
    /// Create a channel on this connection
    async fn create_channel(
        &self,
        transactional: bool,
    ) -> Result<std::sync::Arc<dyn Channel>, ChannelError>;

    /// Check if the connection is still open
    fn is_open(&self) -> bool;
}

/// A broker channel: the unit of delivery-tag scoping and acknowledgment
#[async_trait]
pub trait Channel: Send + Sync {
    /// Confirm a queue exists without creating it; fails if absent
    async fn queue_declare_passive(&self, queue: &QueueName) -> Result<QueueInfo, ChannelError>;

    /// Set the prefetch window for this channel
    async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), ChannelError>;

    /// Start a consumer on a queue; deliveries and lifecycle confirmations
    /// arrive on the returned subscription's event stream
    async fn basic_consume(
        &self,
        queue: &QueueName,
        options: ConsumeOptions,
    ) -> Result<Subscription, ChannelError>;

    /// Cancel a consumer; the broker confirms with a cancel-ok event
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), ChannelError>;

    /// Acknowledge a delivery; with `multiple` set, acknowledges every
    /// outstanding tag up to and including `delivery_tag`
    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), ChannelError>;

    /// Negatively acknowledge a delivery, optionally requeueing it
    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), ChannelError>;

    /// Check if the channel is still open
    fn is_open(&self) -> bool;
}

/// Options for `basic_consume`
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Broker acknowledges deliveries itself; the consumer must not ack
    pub auto_ack: bool,
    /// Explicit consumer tag; the broker generates one when absent
    pub consumer_tag: Option<String>,
    pub no_local: bool,
    pub exclusive: bool,
    /// Consumer arguments passed through to the broker
    pub args: HashMap<String, serde_json::Value>,
}

impl ConsumeOptions {
    /// Create options with defaults (manual acknowledgment)
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable broker-side automatic acknowledgment
    pub fn with_auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Request a specific consumer tag
    pub fn with_consumer_tag(mut self, consumer_tag: String) -> Self {
        self.consumer_tag = Some(consumer_tag);
        self
    }
}

/// Events pushed by the broker client to an active consumer
#[derive(Debug)]
pub enum ConsumerEvent {
    /// The broker accepted the consume request
    ConsumeOk { consumer_tag: String },
    /// A message delivery
    Delivery(Delivery),
    /// The broker confirmed a `basic_cancel`
    CancelOk { consumer_tag: String },
}

/// An active consumer subscription returned by `basic_consume`.
///
/// Dropping the subscription detaches the event stream; it does not cancel
/// the consumer at the broker.
#[derive(Debug)]
pub struct Subscription {
    consumer_tag: String,
    events: mpsc::UnboundedReceiver<ConsumerEvent>,
}

impl Subscription {
    /// Create a subscription from a consumer tag and its event stream
    pub fn new(consumer_tag: String, events: mpsc::UnboundedReceiver<ConsumerEvent>) -> Self {
        Self {
            consumer_tag,
            events,
        }
    }

    /// Tag identifying this consumer on its channel
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Receive the next event; `None` means the broker side is gone
    pub async fn recv(&mut self) -> Option<ConsumerEvent> {
        self.events.recv().await
    }
}
