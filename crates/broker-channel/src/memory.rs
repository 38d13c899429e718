//! In-memory broker implementation for testing and development.
//!
//! This module provides a fully functional in-memory broker that:
//! - Assigns per-channel monotonically increasing delivery tags
//! - Honors cumulative acknowledgment semantics
//! - Requeues negatively acknowledged messages with the redelivered flag set
//! - Records QoS, consume, cancel, ack, and nack calls for assertions
//!
//! This broker is intended for:
//! - Unit testing of listener-runtime consumers
//! - Development and prototyping
//! - Reference behavior for broker client adapters

use crate::channel::{
    Channel, Connection, ConnectionProvider, ConsumeOptions, ConsumerEvent, Subscription,
};
use crate::error::ChannelError;
use crate::message::{Delivery, DeliveryProperties, QueueInfo, QueueName};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message held by the broker, either ready or unacknowledged
#[derive(Debug, Clone)]
struct StoredMessage {
    properties: DeliveryProperties,
    body: Bytes,
    redelivered: bool,
}

/// An attached consumer feeding one subscription event stream
struct ConsumerEntry {
    consumer_tag: String,
    channel_id: u64,
    auto_ack: bool,
    events: mpsc::UnboundedSender<ConsumerEvent>,
}

/// State for a single declared queue
#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    /// Index of the consumer that receives the next dispatch
    next_consumer: usize,
}

/// Per-channel delivery-tag scope and unacknowledged bookkeeping
struct ChannelState {
    next_delivery_tag: u64,
    /// Outstanding deliveries keyed by tag, ascending
    unacked: BTreeMap<u64, (QueueName, StoredMessage)>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            next_delivery_tag: 1,
            unacked: BTreeMap::new(),
        }
    }
}

/// Record of broker calls, inspected by tests
#[derive(Debug, Default)]
pub struct CallLog {
    /// (prefetch_size, prefetch_count, global) per basic_qos call
    pub qos: Vec<(u32, u16, bool)>,
    /// (queue, consumer_tag, auto_ack) per basic_consume call
    pub consumes: Vec<(QueueName, String, bool)>,
    /// Consumer tags passed to basic_cancel
    pub cancels: Vec<String>,
    /// (delivery_tag, multiple) per successful basic_ack
    pub acks: Vec<(u64, bool)>,
    /// (delivery_tag, multiple, requeue) per successful basic_nack
    pub nacks: Vec<(u64, bool, bool)>,
}

struct BrokerInner {
    open: bool,
    fail_acks: bool,
    next_channel_id: u64,
    queues: HashMap<QueueName, QueueState>,
    channels: HashMap<u64, ChannelState>,
    calls: CallLog,
}

impl BrokerInner {
    fn new() -> Self {
        Self {
            open: true,
            fail_acks: false,
            next_channel_id: 1,
            queues: HashMap::new(),
            channels: HashMap::new(),
            calls: CallLog::default(),
        }
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.open {
            Ok(())
        } else {
            Err(ChannelError::ConnectionClosed {
                message: "in-memory broker is closed".to_string(),
            })
        }
    }

    /// Push ready messages to attached consumers until one side runs dry
    fn dispatch(&mut self, queue_name: &QueueName) {
        loop {
            let queue = match self.queues.get_mut(queue_name) {
                Some(queue) => queue,
                None => return,
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let slot = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);
            let consumer_tag = queue.consumers[slot].consumer_tag.clone();
            let channel_id = queue.consumers[slot].channel_id;
            let auto_ack = queue.consumers[slot].auto_ack;
            let events = queue.consumers[slot].events.clone();
            let message = queue.ready.pop_front().expect("ready checked non-empty");

            let channel = self
                .channels
                .get_mut(&channel_id)
                .expect("consumer references a live channel");
            let delivery_tag = channel.next_delivery_tag;
            channel.next_delivery_tag += 1;
            if !auto_ack {
                channel
                    .unacked
                    .insert(delivery_tag, (queue_name.clone(), message.clone()));
            }

            let delivery = Delivery {
                consumer_tag,
                delivery_tag,
                redelivered: message.redelivered,
                exchange: String::new(),
                routing_key: queue_name.as_str().to_string(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if events.send(ConsumerEvent::Delivery(delivery)).is_err() {
                // Subscription dropped: detach the consumer and put the
                // message back at the head of the queue.
                tracing::debug!(
                    queue = %queue_name,
                    "Detaching consumer with dropped subscription"
                );
                let channel = self.channels.get_mut(&channel_id).expect("live channel");
                channel.unacked.remove(&delivery_tag);
                let queue = self.queues.get_mut(queue_name).expect("queue exists");
                queue.consumers.remove(slot);
                queue.ready.push_front(message);
            }
        }
    }

    /// Return a channel's outstanding deliveries to their queues
    fn requeue_unacked(&mut self, channel_id: u64) {
        let mut requeued: Vec<QueueName> = Vec::new();
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            let unacked = std::mem::take(&mut channel.unacked);
            for (_, (queue_name, mut message)) in unacked {
                message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&queue_name) {
                    queue.ready.push_back(message);
                    requeued.push(queue_name);
                }
            }
        }
        for queue_name in requeued {
            self.dispatch(&queue_name);
        }
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker: connection provider, queue store, and test switchboard
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl InMemoryBroker {
    /// Create a new broker with no queues declared
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner::new())),
        }
    }

    /// Declare a queue so passive declaration succeeds
    pub fn declare_queue(&self, queue: &QueueName) {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.queues.entry(queue.clone()).or_default();
    }

    /// Publish a message to a queue, dispatching to an attached consumer
    /// immediately when one exists
    pub fn publish(&self, queue: &QueueName, properties: DeliveryProperties, body: Bytes) {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner
            .queues
            .entry(queue.clone())
            .or_default()
            .ready
            .push_back(StoredMessage {
                properties,
                body,
                redelivered: false,
            });
        inner.dispatch(queue);
    }

    /// Flip the broker's open state. Closing detaches every consumer (their
    /// event streams end) and returns outstanding deliveries to their
    /// queues, as a broker does on connection teardown.
    pub fn set_open(&self, open: bool) {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.open = open;
        if !open {
            for queue in inner.queues.values_mut() {
                queue.consumers.clear();
                queue.next_consumer = 0;
            }
            let channel_ids: Vec<u64> = inner.channels.keys().copied().collect();
            for channel_id in channel_ids {
                inner.requeue_unacked(channel_id);
            }
        }
    }

    /// Make subsequent ack/nack calls fail, simulating a stale channel
    pub fn fail_acks(&self, fail: bool) {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.fail_acks = fail;
    }

    /// Snapshot of recorded acks as (delivery_tag, multiple)
    pub fn acks(&self) -> Vec<(u64, bool)> {
        self.inner
            .lock()
            .expect("broker mutex poisoned")
            .calls
            .acks
            .clone()
    }

    /// Snapshot of recorded nacks as (delivery_tag, multiple, requeue)
    pub fn nacks(&self) -> Vec<(u64, bool, bool)> {
        self.inner
            .lock()
            .expect("broker mutex poisoned")
            .calls
            .nacks
            .clone()
    }

    /// Snapshot of consumer tags passed to basic_cancel
    pub fn cancels(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("broker mutex poisoned")
            .calls
            .cancels
            .clone()
    }

    /// Snapshot of recorded QoS calls as (prefetch_size, prefetch_count, global)
    pub fn qos_calls(&self) -> Vec<(u32, u16, bool)> {
        self.inner
            .lock()
            .expect("broker mutex poisoned")
            .calls
            .qos
            .clone()
    }

    /// Number of basic_consume calls seen for a queue
    pub fn consume_count(&self, queue: &QueueName) -> usize {
        self.inner
            .lock()
            .expect("broker mutex poisoned")
            .calls
            .consumes
            .iter()
            .filter(|record| record.0 == *queue)
            .count()
    }

    /// Snapshot of recorded consume calls as (queue, consumer_tag, auto_ack)
    pub fn consumes(&self) -> Vec<(QueueName, String, bool)> {
        self.inner
            .lock()
            .expect("broker mutex poisoned")
            .calls
            .consumes
            .clone()
    }

    /// Number of consumers currently attached to a queue
    pub fn active_consumers(&self, queue: &QueueName) -> usize {
        self.inner
            .lock()
            .expect("broker mutex poisoned")
            .queues
            .get(queue)
            .map(|state| state.consumers.len())
            .unwrap_or(0)
    }

    /// Number of messages waiting (not in flight) on a queue
    pub fn ready_count(&self, queue: &QueueName) -> usize {
        self.inner
            .lock()
            .expect("broker mutex poisoned")
            .queues
            .get(queue)
            .map(|state| state.ready.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionProvider for InMemoryBroker {
    async fn create_connection(&self) -> Result<Arc<dyn Connection>, ChannelError> {
        let inner = self.inner.lock().expect("broker mutex poisoned");
        inner.ensure_open()?;
        Ok(Arc::new(InMemoryConnection {
            inner: Arc::clone(&self.inner),
        }))
    }
}

// ============================================================================
// InMemoryConnection
// ============================================================================

struct InMemoryConnection {
    inner: Arc<Mutex<BrokerInner>>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn create_channel(&self, _transactional: bool) -> Result<Arc<dyn Channel>, ChannelError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.ensure_open()?;
        let channel_id = inner.next_channel_id;
        inner.next_channel_id += 1;
        inner.channels.insert(channel_id, ChannelState::new());
        Ok(Arc::new(InMemoryChannel {
            channel_id,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn is_open(&self) -> bool {
        self.inner.lock().expect("broker mutex poisoned").open
    }
}

// ============================================================================
// InMemoryChannel
// ============================================================================

struct InMemoryChannel {
    channel_id: u64,
    inner: Arc<Mutex<BrokerInner>>,
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn queue_declare_passive(&self, queue: &QueueName) -> Result<QueueInfo, ChannelError> {
        let inner = self.inner.lock().expect("broker mutex poisoned");
        inner.ensure_open()?;
        match inner.queues.get(queue) {
            Some(state) => Ok(QueueInfo {
                name: queue.clone(),
                message_count: state.ready.len() as u32,
                consumer_count: state.consumers.len() as u32,
            }),
            None => Err(ChannelError::QueueNotFound {
                queue_name: queue.as_str().to_string(),
            }),
        }
    }

    async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.ensure_open()?;
        inner.calls.qos.push((prefetch_size, prefetch_count, global));
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &QueueName,
        options: ConsumeOptions,
    ) -> Result<Subscription, ChannelError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.ensure_open()?;
        if !inner.queues.contains_key(queue) {
            return Err(ChannelError::QueueNotFound {
                queue_name: queue.as_str().to_string(),
            });
        }

        let consumer_tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("ctag-{}", uuid::Uuid::new_v4()));
        inner
            .calls
            .consumes
            .push((queue.clone(), consumer_tag.clone(), options.auto_ack));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(ConsumerEvent::ConsumeOk {
            consumer_tag: consumer_tag.clone(),
        });

        let queue_state = inner.queues.get_mut(queue).expect("existence checked");
        queue_state.consumers.push(ConsumerEntry {
            consumer_tag: consumer_tag.clone(),
            channel_id: self.channel_id,
            auto_ack: options.auto_ack,
            events: events_tx,
        });
        inner.dispatch(queue);

        Ok(Subscription::new(consumer_tag, events_rx))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.ensure_open()?;
        inner.calls.cancels.push(consumer_tag.to_string());

        for queue_state in inner.queues.values_mut() {
            if let Some(index) = queue_state
                .consumers
                .iter()
                .position(|entry| entry.consumer_tag == consumer_tag)
            {
                let entry = queue_state.consumers.remove(index);
                queue_state.next_consumer = 0;
                let _ = entry.events.send(ConsumerEvent::CancelOk {
                    consumer_tag: consumer_tag.to_string(),
                });
                return Ok(());
            }
        }

        Err(ChannelError::ConsumerNotFound {
            consumer_tag: consumer_tag.to_string(),
        })
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.ensure_open()?;
        if inner.fail_acks {
            return Err(ChannelError::Broker {
                code: "bad-ack".to_string(),
                message: "ack failure injected".to_string(),
            });
        }
        inner.calls.acks.push((delivery_tag, multiple));

        let channel = inner
            .channels
            .get_mut(&self.channel_id)
            .expect("channel registered at creation");
        if multiple {
            channel.unacked.retain(|tag, _| *tag > delivery_tag);
        } else {
            channel.unacked.remove(&delivery_tag);
        }
        Ok(())
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("broker mutex poisoned");
        inner.ensure_open()?;
        if inner.fail_acks {
            return Err(ChannelError::Broker {
                code: "bad-nack".to_string(),
                message: "nack failure injected".to_string(),
            });
        }
        inner.calls.nacks.push((delivery_tag, multiple, requeue));

        let removed: Vec<(QueueName, StoredMessage)> = {
            let channel = inner
                .channels
                .get_mut(&self.channel_id)
                .expect("channel registered at creation");
            let affected: Vec<u64> = channel
                .unacked
                .keys()
                .copied()
                .filter(|tag| {
                    if multiple {
                        *tag <= delivery_tag
                    } else {
                        *tag == delivery_tag
                    }
                })
                .collect();
            affected
                .into_iter()
                .filter_map(|tag| channel.unacked.remove(&tag))
                .collect()
        };

        // Without requeue the messages are discarded; dead-letter routing is
        // outside this broker's scope.
        if requeue {
            let mut touched: Vec<QueueName> = Vec::new();
            for (queue_name, mut message) in removed {
                message.redelivered = true;
                if let Some(queue) = inner.queues.get_mut(&queue_name) {
                    queue.ready.push_back(message);
                    touched.push(queue_name);
                }
            }
            for queue_name in touched {
                inner.dispatch(&queue_name);
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().expect("broker mutex poisoned").open
    }
}
