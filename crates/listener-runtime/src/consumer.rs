//! A single queue consumer: one subscription on one channel.
//!
//! Each consumer owns its channel and its ack batch exclusively. Deliveries
//! are handled one at a time inside the consumer's task; the container and
//! the recovery monitor only observe consumer state from outside and signal
//! cancellation through [`QueueConsumer::request_cancel`].

use crate::ack::AckBatcher;
use crate::classifier::{ConditionalRejectingClassifier, DeliveryOutcome};
use crate::config::{AcknowledgeMode, ContainerConfig};
use crate::error::ListenerError;
use crate::handler::{ManualAckHandle, MessageHandler};
use broker_channel::channel::{Channel, Connection, ConsumeOptions, ConsumerEvent, Subscription};
use broker_channel::message::{Delivery, QueueName, Timestamp};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Consumer lifecycle states. Cancelled is terminal for an instance; the
/// container spawns a replacement instead of reviving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Initializing,
    Consuming,
    Cancelling,
    Cancelled,
}

struct ConsumerFlags {
    /// Set when an ack or nack failed; evidence of channel loss
    ack_failed: bool,
    /// When the last delivery arrived
    last_activity: Timestamp,
    /// Highest delivery tag observed on this channel
    last_tag: u64,
}

struct ConsumerShared {
    queue: QueueName,
    state_tx: watch::Sender<ConsumerState>,
    flags: Mutex<ConsumerFlags>,
    cancel: Notify,
}

impl ConsumerShared {
    fn set_state(&self, state: ConsumerState) {
        self.state_tx.send_replace(state);
    }

    fn mark_ack_failed(&self) {
        self.flags.lock().expect("consumer mutex poisoned").ack_failed = true;
    }
}

/// One active subscription on one channel for one queue
pub struct QueueConsumer {
    channel: Arc<dyn Channel>,
    consumer_tag: String,
    batcher: Arc<AckBatcher>,
    shared: Arc<ConsumerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QueueConsumer {
    /// Open a channel, issue QoS, confirm the queue exists, and start
    /// consuming.
    ///
    /// A passive-declare failure is reported as a declaration failure and
    /// leaves no consumer behind; the caller owns the retry schedule.
    pub(crate) async fn subscribe(
        connection: &Arc<dyn Connection>,
        queue: QueueName,
        config: &ContainerConfig,
        handler: Arc<dyn MessageHandler>,
        classifier: Arc<ConditionalRejectingClassifier>,
    ) -> Result<Arc<Self>, ListenerError> {
        let channel = connection.create_channel(false).await?;

        // QoS exactly once per channel, before the first consume.
        channel
            .basic_qos(0, config.effective_prefetch(), false)
            .await?;

        if let Err(source) = channel.queue_declare_passive(&queue).await {
            return Err(ListenerError::DeclarationFailed {
                queue,
                attempts: 1,
                source,
            });
        }

        let mut options = ConsumeOptions::new()
            .with_consumer_tag(format!("ctag-{}", uuid::Uuid::new_v4()));
        if config.acknowledge_mode.is_none() {
            options = options.with_auto_ack();
        }
        let subscription = channel.basic_consume(&queue, options).await?;
        let consumer_tag = subscription.consumer_tag().to_string();

        let batcher = Arc::new(AckBatcher::new(
            Arc::clone(&channel),
            config.messages_per_ack,
        ));
        let (state_tx, _) = watch::channel(ConsumerState::Initializing);
        let shared = Arc::new(ConsumerShared {
            queue: queue.clone(),
            state_tx,
            flags: Mutex::new(ConsumerFlags {
                ack_failed: false,
                last_activity: Timestamp::now(),
                last_tag: 0,
            }),
            cancel: Notify::new(),
        });

        info!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            prefetch = config.effective_prefetch(),
            "Starting consumer"
        );

        let task = tokio::spawn(run_loop(
            subscription,
            Arc::clone(&channel),
            Arc::clone(&batcher),
            Arc::clone(&shared),
            handler,
            classifier,
            config.acknowledge_mode,
        ));

        Ok(Arc::new(Self {
            channel,
            consumer_tag,
            batcher,
            shared,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn queue(&self) -> &QueueName {
        &self.shared.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> ConsumerState {
        *self.shared.state_tx.borrow()
    }

    /// Check if this consumer's channel still reports open
    pub fn channel_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Check if an ack or nack has failed on this consumer's channel
    pub fn ack_failed(&self) -> bool {
        self.shared
            .flags
            .lock()
            .expect("consumer mutex poisoned")
            .ack_failed
    }

    /// When the last delivery arrived
    pub fn last_activity(&self) -> Timestamp {
        self.shared
            .flags
            .lock()
            .expect("consumer mutex poisoned")
            .last_activity
    }

    pub(crate) fn batcher(&self) -> &Arc<AckBatcher> {
        &self.batcher
    }

    /// Flush this consumer's ack batch when it has been open longer than
    /// `timeout`. A flush failure is channel-loss evidence and marks the
    /// consumer for replacement.
    pub(crate) async fn flush_stale(&self, timeout: Duration) {
        if let Err(e) = self.batcher.flush_if_stale(timeout).await {
            warn!(
                queue = %self.shared.queue,
                error = %e,
                "Stale ack flush failed; treating as channel loss"
            );
            self.shared.mark_ack_failed();
        }
    }

    /// Signal the consumer task to begin the cancel protocol
    pub(crate) fn request_cancel(&self) {
        self.shared.cancel.notify_one();
    }

    /// Wait until the consumer reports consuming. Returns false when it was
    /// cancelled first or the timeout elapsed.
    pub(crate) async fn wait_consuming(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ConsumerState::Consuming => return true,
                ConsumerState::Cancelled => return false,
                _ => {}
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return *rx.borrow() == ConsumerState::Consuming,
            }
        }
    }

    /// Wait until the consumer reports cancelled
    pub(crate) async fn wait_cancelled(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == ConsumerState::Cancelled {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return *rx.borrow() == ConsumerState::Cancelled,
            }
        }
    }

    /// Tear the consumer down without broker interaction: abort the task and
    /// mark the instance cancelled. Used when the channel is already dead or
    /// the graceful deadline has passed.
    pub(crate) fn force_cancel(&self) {
        if let Some(task) = self
            .task
            .lock()
            .expect("consumer mutex poisoned")
            .take()
        {
            task.abort();
        }
        self.shared.set_state(ConsumerState::Cancelled);
    }

    /// Cancel this consumer, waiting up to `timeout` for the broker's
    /// confirmation. Falls back to a forced teardown and returns false when
    /// the confirmation does not arrive in time.
    pub(crate) async fn cancel(&self, timeout: Duration) -> bool {
        self.request_cancel();
        let graceful = self.wait_cancelled(timeout).await;
        if !graceful {
            warn!(
                queue = %self.shared.queue,
                consumer_tag = %self.consumer_tag,
                "Consumer did not confirm cancellation in time; forcing teardown"
            );
            self.force_cancel();
        }
        graceful
    }
}

// ============================================================================
// Consumer event loop
// ============================================================================

async fn run_loop(
    mut subscription: Subscription,
    channel: Arc<dyn Channel>,
    batcher: Arc<AckBatcher>,
    shared: Arc<ConsumerShared>,
    handler: Arc<dyn MessageHandler>,
    classifier: Arc<ConditionalRejectingClassifier>,
    mode: AcknowledgeMode,
) {
    let consumer_tag = subscription.consumer_tag().to_string();
    let mut cancelling = false;
    loop {
        tokio::select! {
            _ = shared.cancel.notified() => {
                if cancelling {
                    continue;
                }
                cancelling = true;
                shared.set_state(ConsumerState::Cancelling);

                if !channel.is_open() {
                    // Nothing more can be sent on a dead channel.
                    debug!(
                        queue = %shared.queue,
                        "Channel closed at cancel time; skipping basic-cancel"
                    );
                    shared.set_state(ConsumerState::Cancelled);
                    return;
                }
                if let Err(e) = channel.basic_cancel(&consumer_tag).await {
                    warn!(
                        queue = %shared.queue,
                        error = %e,
                        "basic-cancel failed; treating consumer as cancelled"
                    );
                    shared.set_state(ConsumerState::Cancelled);
                    return;
                }
                // Stay in the loop: the broker confirms with cancel-ok.
            }
            event = subscription.recv() => match event {
                None => {
                    debug!(
                        queue = %shared.queue,
                        "Consumer event stream ended; consumer cancelled"
                    );
                    shared.set_state(ConsumerState::Cancelled);
                    return;
                }
                Some(ConsumerEvent::ConsumeOk { consumer_tag }) => {
                    debug!(
                        queue = %shared.queue,
                        consumer_tag = %consumer_tag,
                        "Broker confirmed consume"
                    );
                    shared.set_state(ConsumerState::Consuming);
                }
                Some(ConsumerEvent::CancelOk { consumer_tag }) => {
                    if let Err(e) = batcher.flush_now().await {
                        warn!(
                            queue = %shared.queue,
                            error = %e,
                            "Final ack flush failed during cancellation"
                        );
                        shared.mark_ack_failed();
                    }
                    info!(
                        queue = %shared.queue,
                        consumer_tag = %consumer_tag,
                        "Consumer cancelled"
                    );
                    shared.set_state(ConsumerState::Cancelled);
                    return;
                }
                Some(ConsumerEvent::Delivery(delivery)) => {
                    handle_delivery(
                        &delivery,
                        &channel,
                        &batcher,
                        &shared,
                        handler.as_ref(),
                        &classifier,
                        mode,
                    )
                    .await;
                }
            }
        }
    }
}

async fn handle_delivery(
    delivery: &Delivery,
    channel: &Arc<dyn Channel>,
    batcher: &Arc<AckBatcher>,
    shared: &Arc<ConsumerShared>,
    handler: &dyn MessageHandler,
    classifier: &ConditionalRejectingClassifier,
    mode: AcknowledgeMode,
) {
    {
        let mut flags = shared.flags.lock().expect("consumer mutex poisoned");
        // Tags on one channel never decrease and never overlap.
        if delivery.delivery_tag <= flags.last_tag {
            error!(
                queue = %shared.queue,
                delivery_tag = delivery.delivery_tag,
                last_tag = flags.last_tag,
                "Delivery tag out of order"
            );
            debug_assert!(
                delivery.delivery_tag > flags.last_tag,
                "delivery tags must be strictly increasing per channel"
            );
        }
        flags.last_tag = flags.last_tag.max(delivery.delivery_tag);
        flags.last_activity = Timestamp::now();
    }

    match mode {
        AcknowledgeMode::None => {
            // Broker already acked at consume time; classification runs for
            // its logging contract only.
            if let Err(e) = handler.handle(delivery).await {
                classifier.classify(delivery, &e);
            }
        }
        AcknowledgeMode::Manual => {
            let ack = ManualAckHandle::new(
                Arc::clone(channel),
                Arc::clone(batcher),
                delivery.delivery_tag,
            );
            if let Err(e) = handler.handle_manual(delivery, ack).await {
                let outcome = classifier.classify(delivery, &e);
                if let DeliveryOutcome::RejectNoRequeue { discard_with_ack } = outcome {
                    if classifier.reject_manual() {
                        settle_failure(delivery, batcher, shared, discard_with_ack).await;
                    }
                }
                // A requeue outcome is left to the application in MANUAL
                // mode; the broker redelivers on channel close regardless.
            }
        }
        AcknowledgeMode::Auto => {
            let outcome = match handler.handle(delivery).await {
                Ok(()) => DeliveryOutcome::Ack,
                Err(e) => classifier.classify(delivery, &e),
            };
            let result = match outcome {
                DeliveryOutcome::Ack => batcher.submit(delivery.delivery_tag).await,
                DeliveryOutcome::RequeueNack => {
                    batcher.nack_now(delivery.delivery_tag, true).await
                }
                DeliveryOutcome::RejectNoRequeue { discard_with_ack: true } => {
                    batcher.ack_now(delivery.delivery_tag).await
                }
                DeliveryOutcome::RejectNoRequeue { discard_with_ack: false } => {
                    batcher.reject_now(delivery.delivery_tag).await
                }
            };
            if let Err(e) = result {
                warn!(
                    queue = %shared.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Acknowledgment failed; treating as channel loss"
                );
                shared.mark_ack_failed();
            }
        }
    }
}

/// Execute a reject outcome on behalf of a MANUAL-mode handler
async fn settle_failure(
    delivery: &Delivery,
    batcher: &Arc<AckBatcher>,
    shared: &Arc<ConsumerShared>,
    discard_with_ack: bool,
) {
    let result = if discard_with_ack {
        batcher.ack_now(delivery.delivery_tag).await
    } else {
        batcher.reject_now(delivery.delivery_tag).await
    };
    if let Err(e) = result {
        warn!(
            queue = %shared.queue,
            delivery_tag = delivery.delivery_tag,
            error = %e,
            "Reject failed; treating as channel loss"
        );
        shared.mark_ack_failed();
    }
}
