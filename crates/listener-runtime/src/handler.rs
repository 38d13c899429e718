//! Application-facing handler contract.

use crate::ack::AckBatcher;
use crate::error::HandlerError;
use async_trait::async_trait;
use broker_channel::channel::Channel;
use broker_channel::error::ChannelError;
use broker_channel::message::Delivery;
use std::sync::Arc;

/// Application-supplied message handler.
///
/// `handle` is invoked once per delivery, one invocation at a time per
/// consumer; consumers on different queues (or concurrency slots) run fully
/// concurrently with each other. A returned error is classified by the
/// container's error classifier, never propagated past the consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;

    /// MANUAL-mode entry point carrying the acknowledgment handle.
    ///
    /// The default implementation ignores the handle and delegates to
    /// `handle`, leaving the delivery unacknowledged.
    async fn handle_manual(
        &self,
        delivery: &Delivery,
        ack: ManualAckHandle,
    ) -> Result<(), HandlerError> {
        let _ = ack;
        self.handle(delivery).await
    }
}

/// Acknowledgment handle passed to MANUAL-mode handlers.
///
/// Manual acks bypass batching and go to the broker immediately. A
/// cumulative ack also settles lower tags still pending in the consumer's
/// batch, so the batcher bookkeeping is subsumed alongside.
pub struct ManualAckHandle {
    channel: Arc<dyn Channel>,
    batcher: Arc<AckBatcher>,
    delivery_tag: u64,
}

impl ManualAckHandle {
    pub(crate) fn new(
        channel: Arc<dyn Channel>,
        batcher: Arc<AckBatcher>,
        delivery_tag: u64,
    ) -> Self {
        Self {
            channel,
            batcher,
            delivery_tag,
        }
    }

    /// Tag of the delivery this handle acknowledges
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledge this delivery; with `multiple` set, every outstanding
    /// delivery up to it
    pub async fn ack(&self, multiple: bool) -> Result<(), ChannelError> {
        self.channel.basic_ack(self.delivery_tag, multiple).await?;
        if multiple {
            self.batcher.subsume_up_to(self.delivery_tag).await;
        }
        Ok(())
    }

    /// Negatively acknowledge this delivery, optionally requeueing it
    pub async fn nack(&self, requeue: bool) -> Result<(), ChannelError> {
        self.channel
            .basic_nack(self.delivery_tag, false, requeue)
            .await
    }
}
