//! Tests for deferred acknowledgment batching.

use super::*;
use broker_channel::channel::ConnectionProvider;
use broker_channel::memory::InMemoryBroker;
use broker_channel::message::QueueName;
use tokio_test::assert_ok;

async fn batcher_on(broker: &InMemoryBroker, messages_per_ack: u32) -> AckBatcher {
    let connection = broker.create_connection().await.expect("connection");
    let channel = connection.create_channel(false).await.expect("channel");
    AckBatcher::new(channel, messages_per_ack)
}

// ============================================================================
// Threshold Flush Tests
// ============================================================================

mod threshold {
    use super::*;

    /// Verify no ack is issued before the batch size is reached, and exactly
    /// one cumulative ack once it is.
    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 3).await;

        batcher.submit(1).await.expect("submit");
        batcher.submit(2).await.expect("submit");
        assert!(broker.acks().is_empty(), "no ack before the threshold");

        batcher.submit(3).await.expect("submit");

        assert_eq!(broker.acks(), vec![(3, true)]);
        assert_eq!(batcher.pending_count().await, 0);
    }

    /// Verify a batch size of one acks every delivery as it is submitted.
    #[tokio::test]
    async fn test_per_message_ack() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 1).await;

        batcher.submit(1).await.expect("submit");
        batcher.submit(2).await.expect("submit");

        assert_eq!(broker.acks(), vec![(1, true), (2, true)]);
    }

    /// Verify acking the watermark is equivalent to acking each lower tag:
    /// nothing below the watermark stays unacknowledged at the broker.
    #[tokio::test]
    async fn test_cumulative_ack_covers_lower_tags() {
        let broker = InMemoryBroker::new();
        let queue = QueueName::new("orders".to_string()).expect("valid name");
        broker.declare_queue(&queue);
        let connection = broker.create_connection().await.expect("connection");
        let channel = connection.create_channel(false).await.expect("channel");
        let mut subscription = channel
            .basic_consume(&queue, broker_channel::ConsumeOptions::new())
            .await
            .expect("consume");
        let batcher = AckBatcher::new(channel, 2);
        for body in ["a", "b"] {
            broker.publish(&queue, Default::default(), body.into());
        }
        let mut tags = Vec::new();
        while tags.len() < 2 {
            if let Some(broker_channel::ConsumerEvent::Delivery(d)) = subscription.recv().await {
                tags.push(d.delivery_tag);
            }
        }

        batcher.submit(tags[0]).await.expect("submit");
        batcher.submit(tags[1]).await.expect("submit");

        // One cumulative ack; closing the broker requeues nothing because
        // both tags are settled.
        assert_eq!(broker.acks(), vec![(tags[1], true)]);
        broker.set_open(false);
        assert_eq!(broker.ready_count(&queue), 0);
    }
}

// ============================================================================
// Timer Flush Tests
// ============================================================================

mod staleness {
    use super::*;

    /// Verify a stale batch flushes for its high-water tag.
    #[tokio::test]
    async fn test_flush_if_stale_after_timeout() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 10).await;
        batcher.submit(4).await.expect("submit");

        let flushed = batcher
            .flush_if_stale(Duration::from_millis(40))
            .await
            .expect("flush");
        assert!(!flushed, "batch is not stale yet");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let flushed = batcher
            .flush_if_stale(Duration::from_millis(40))
            .await
            .expect("flush");

        assert!(flushed);
        assert_eq!(broker.acks(), vec![(4, true)]);
    }

    /// Verify an empty batch never flushes on staleness.
    #[tokio::test]
    async fn test_empty_batch_not_flushed() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 10).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let flushed = batcher
            .flush_if_stale(Duration::from_millis(1))
            .await
            .expect("flush");

        assert!(!flushed);
        assert!(broker.acks().is_empty());
    }

    /// Verify flush_now is idempotent: a second call with nothing pending
    /// issues nothing.
    #[tokio::test]
    async fn test_flush_now_idempotent() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 10).await;
        batcher.submit(2).await.expect("submit");

        assert_ok!(batcher.flush_now().await);
        assert_ok!(batcher.flush_now().await);

        assert_eq!(broker.acks(), vec![(2, true)]);
    }
}

// ============================================================================
// Immediate Nack and Reject Tests
// ============================================================================

mod immediate {
    use super::*;

    /// Verify pending acks below a failed tag are flushed before the nack,
    /// so the nack with multiple set settles exactly the failed delivery.
    #[tokio::test]
    async fn test_nack_flushes_pending_first() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 10).await;
        batcher.submit(1).await.expect("submit");
        batcher.submit(2).await.expect("submit");

        batcher.nack_now(3, true).await.expect("nack");

        assert_eq!(broker.acks(), vec![(2, true)]);
        assert_eq!(broker.nacks(), vec![(3, true, true)]);
        assert_eq!(batcher.pending_count().await, 0);
    }

    /// Verify a nack with no pending acks issues only the nack.
    #[tokio::test]
    async fn test_nack_without_pending() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 10).await;

        batcher.nack_now(1, true).await.expect("nack");

        assert!(broker.acks().is_empty());
        assert_eq!(broker.nacks(), vec![(1, true, true)]);
    }

    /// Verify a reject flushes pending acks and nacks the single tag
    /// without requeue.
    #[tokio::test]
    async fn test_reject_single_tag_no_requeue() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 10).await;
        batcher.submit(5).await.expect("submit");

        batcher.reject_now(6).await.expect("reject");

        assert_eq!(broker.acks(), vec![(5, true)]);
        assert_eq!(broker.nacks(), vec![(6, false, false)]);
    }

    /// Verify an immediate cumulative ack subsumes the pending batch.
    #[tokio::test]
    async fn test_ack_now_subsumes_pending() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 10).await;
        batcher.submit(1).await.expect("submit");
        batcher.submit(2).await.expect("submit");

        batcher.ack_now(4).await.expect("ack");

        assert_eq!(broker.acks(), vec![(4, true)]);
        assert_eq!(batcher.pending_count().await, 0);
        // Nothing left to flush.
        batcher.flush_now().await.expect("flush");
        assert_eq!(broker.acks(), vec![(4, true)]);
    }
}

// ============================================================================
// Subsumption Tests
// ============================================================================

mod subsumption {
    use super::*;

    /// Verify a cumulative manual ack at the watermark clears the batch.
    #[tokio::test]
    async fn test_subsume_at_watermark() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 10).await;
        batcher.submit(1).await.expect("submit");
        batcher.submit(2).await.expect("submit");

        batcher.subsume_up_to(2).await;

        assert_eq!(batcher.pending_count().await, 0);
        batcher.flush_now().await.expect("flush");
        assert!(broker.acks().is_empty());
    }

    /// Verify a subsumption below the watermark leaves the batch on its
    /// normal schedule.
    #[tokio::test]
    async fn test_subsume_below_watermark_keeps_batch() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 10).await;
        batcher.submit(5).await.expect("submit");

        batcher.subsume_up_to(3).await;

        assert_eq!(batcher.pending_count().await, 1);
        batcher.flush_now().await.expect("flush");
        assert_eq!(broker.acks(), vec![(5, true)]);
    }
}

// ============================================================================
// Failure Propagation Tests
// ============================================================================

mod failures {
    use super::*;

    /// Verify a failed flush keeps the batch intact for a retry.
    #[tokio::test]
    async fn test_failed_flush_preserves_batch() {
        let broker = InMemoryBroker::new();
        let batcher = batcher_on(&broker, 10).await;
        batcher.submit(3).await.expect("submit");

        broker.fail_acks(true);
        let result = batcher.flush_now().await;
        assert!(result.is_err());
        assert_eq!(batcher.pending_count().await, 1);

        broker.fail_acks(false);
        batcher.flush_now().await.expect("flush");
        assert_eq!(broker.acks(), vec![(3, true)]);
    }
}
