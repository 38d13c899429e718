//! Deferred acknowledgment batching.
//!
//! One [`AckBatcher`] exists per consumer and is the only component issuing
//! acks on that consumer's channel, so acknowledgments leave in
//! non-decreasing tag order. Acknowledgment is cumulative: flushing the
//! high-water tag with `multiple` set settles every outstanding tag below
//! it, so the batcher tracks a single watermark rather than a tag set.

use broker_channel::channel::Channel;
use broker_channel::error::ChannelError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(test)]
#[path = "ack_tests.rs"]
mod tests;

struct BatchState {
    /// Highest tag submitted since the last flush
    high_water: Option<u64>,
    /// Deliveries submitted since the last flush
    pending_count: u32,
    /// When the batch was last flushed (or created)
    last_flush: Instant,
}

/// Accumulates delivery tags for one consumer and flushes them as cumulative
/// acks on a count or staleness threshold
pub struct AckBatcher {
    channel: Arc<dyn Channel>,
    messages_per_ack: u32,
    state: Mutex<BatchState>,
}

impl AckBatcher {
    /// Create a batcher for a consumer's channel
    pub fn new(channel: Arc<dyn Channel>, messages_per_ack: u32) -> Self {
        Self {
            channel,
            messages_per_ack: messages_per_ack.max(1),
            state: Mutex::new(BatchState {
                high_water: None,
                pending_count: 0,
                last_flush: Instant::now(),
            }),
        }
    }

    /// Record a tag as acknowledged, flushing once the batch is full
    pub async fn submit(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        state.high_water = Some(state.high_water.map_or(delivery_tag, |t| t.max(delivery_tag)));
        state.pending_count += 1;
        if state.pending_count >= self.messages_per_ack {
            self.flush_locked(&mut state).await?;
        }
        Ok(())
    }

    /// Flush whatever is pending; a no-op when nothing is
    pub async fn flush_now(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    /// Flush pending acks whose batch has been open longer than `timeout`.
    ///
    /// Returns true when a flush was issued. Called from the recovery
    /// monitor's tick.
    pub async fn flush_if_stale(&self, timeout: Duration) -> Result<bool, ChannelError> {
        let mut state = self.state.lock().await;
        if state.pending_count > 0 && state.last_flush.elapsed() >= timeout {
            self.flush_locked(&mut state).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Negatively acknowledge one failed delivery immediately.
    ///
    /// Pending acks below the failed tag are flushed first, so the nack with
    /// `multiple` set settles exactly the failed delivery.
    pub async fn nack_now(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await?;
        self.channel.basic_nack(delivery_tag, true, requeue).await?;
        state.last_flush = Instant::now();
        Ok(())
    }

    /// Reject one delivery without requeue, leaving other pending acks to
    /// their normal schedule after flushing those below it
    pub async fn reject_now(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await?;
        self.channel.basic_nack(delivery_tag, false, false).await?;
        state.last_flush = Instant::now();
        Ok(())
    }

    /// Acknowledge up to and including `delivery_tag` immediately,
    /// subsuming any lower pending batched tags
    pub async fn ack_now(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        self.channel.basic_ack(delivery_tag, true).await?;
        self.subsume_locked(&mut state, delivery_tag);
        state.last_flush = Instant::now();
        Ok(())
    }

    /// Drop pending bookkeeping for tags settled out-of-band by a cumulative
    /// manual ack up to `delivery_tag`
    pub async fn subsume_up_to(&self, delivery_tag: u64) {
        let mut state = self.state.lock().await;
        self.subsume_locked(&mut state, delivery_tag);
    }

    /// Deliveries submitted and not yet flushed
    pub async fn pending_count(&self) -> u32 {
        self.state.lock().await.pending_count
    }

    async fn flush_locked(&self, state: &mut BatchState) -> Result<(), ChannelError> {
        let Some(high_water) = state.high_water else {
            return Ok(());
        };
        debug!(
            delivery_tag = high_water,
            pending = state.pending_count,
            "Flushing cumulative ack"
        );
        self.channel.basic_ack(high_water, true).await?;
        state.high_water = None;
        state.pending_count = 0;
        state.last_flush = Instant::now();
        Ok(())
    }

    fn subsume_locked(&self, state: &mut BatchState, delivery_tag: u64) {
        // The watermark model cannot split a batch: only a subsumption at or
        // above the watermark clears it, a lower one leaves the batch to its
        // normal schedule.
        if state.high_water.is_some_and(|t| t <= delivery_tag) {
            state.high_water = None;
            state.pending_count = 0;
        }
    }
}
