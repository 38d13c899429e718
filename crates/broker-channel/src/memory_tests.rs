//! Tests for the in-memory broker.

use super::*;
use crate::channel::ConsumerEvent;
use crate::message::DeliveryProperties;
use tokio_test::assert_ok;

fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).expect("valid queue name")
}

async fn open_channel(broker: &InMemoryBroker) -> Arc<dyn Channel> {
    let connection = broker.create_connection().await.expect("connection");
    connection.create_channel(false).await.expect("channel")
}

/// Receive events until a delivery arrives, panicking on stream end.
async fn next_delivery(subscription: &mut Subscription) -> Delivery {
    loop {
        match subscription.recv().await {
            Some(ConsumerEvent::Delivery(delivery)) => return delivery,
            Some(_) => continue,
            None => panic!("event stream ended while waiting for a delivery"),
        }
    }
}

// ============================================================================
// Declaration and Consume Tests
// ============================================================================

mod declaration {
    use super::*;

    /// Verify passive declaration fails for an unknown queue.
    #[tokio::test]
    async fn test_passive_declare_missing_queue() {
        let broker = InMemoryBroker::new();
        let channel = open_channel(&broker).await;

        let result = channel.queue_declare_passive(&queue("missing")).await;

        assert!(matches!(
            result,
            Err(ChannelError::QueueNotFound { queue_name }) if queue_name == "missing"
        ));
    }

    /// Verify passive declaration reports message and consumer counts.
    #[tokio::test]
    async fn test_passive_declare_reports_counts() {
        let broker = InMemoryBroker::new();
        let orders = queue("orders");
        broker.declare_queue(&orders);
        broker.publish(&orders, DeliveryProperties::new(), "a".into());
        broker.publish(&orders, DeliveryProperties::new(), "b".into());
        let channel = open_channel(&broker).await;

        let info = channel
            .queue_declare_passive(&orders)
            .await
            .expect("declare");

        assert_eq!(info.name, orders);
        assert_eq!(info.message_count, 2);
        assert_eq!(info.consumer_count, 0);
    }

    /// Verify the first event on a new subscription is consume-ok.
    #[tokio::test]
    async fn test_consume_ok_is_first_event() {
        let broker = InMemoryBroker::new();
        let orders = queue("orders");
        broker.declare_queue(&orders);
        let channel = open_channel(&broker).await;

        let mut subscription = channel
            .basic_consume(&orders, ConsumeOptions::new())
            .await
            .expect("consume");

        let tag = subscription.consumer_tag().to_string();
        match subscription.recv().await {
            Some(ConsumerEvent::ConsumeOk { consumer_tag }) => assert_eq!(consumer_tag, tag),
            other => panic!("expected ConsumeOk, got {other:?}"),
        }
    }
}

// ============================================================================
// Delivery and Acknowledgment Tests
// ============================================================================

mod delivery {
    use super::*;

    /// Verify delivery tags increase monotonically per channel.
    #[tokio::test]
    async fn test_delivery_tags_monotonic() {
        let broker = InMemoryBroker::new();
        let orders = queue("orders");
        broker.declare_queue(&orders);
        let channel = open_channel(&broker).await;
        let mut subscription = channel
            .basic_consume(&orders, ConsumeOptions::new())
            .await
            .expect("consume");

        for body in ["a", "b", "c"] {
            broker.publish(&orders, DeliveryProperties::new(), body.into());
        }

        let first = next_delivery(&mut subscription).await;
        let second = next_delivery(&mut subscription).await;
        let third = next_delivery(&mut subscription).await;

        assert_eq!(first.delivery_tag, 1);
        assert_eq!(second.delivery_tag, 2);
        assert_eq!(third.delivery_tag, 3);
        assert!(!first.redelivered);
    }

    /// Verify a cumulative ack settles every tag at or below the watermark.
    #[tokio::test]
    async fn test_cumulative_ack_settles_lower_tags() {
        let broker = InMemoryBroker::new();
        let orders = queue("orders");
        broker.declare_queue(&orders);
        let channel = open_channel(&broker).await;
        let mut subscription = channel
            .basic_consume(&orders, ConsumeOptions::new())
            .await
            .expect("consume");
        for body in ["a", "b", "c"] {
            broker.publish(&orders, DeliveryProperties::new(), body.into());
        }
        for _ in 0..3 {
            next_delivery(&mut subscription).await;
        }

        channel.basic_ack(3, true).await.expect("ack");

        // Closing the broker requeues unacknowledged messages; none remain.
        broker.set_open(false);
        assert_eq!(broker.ready_count(&orders), 0);
        assert_eq!(broker.acks(), vec![(3, true)]);
    }

    /// Verify a nack with requeue redelivers with the redelivered flag set.
    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let orders = queue("orders");
        broker.declare_queue(&orders);
        let channel = open_channel(&broker).await;
        let mut subscription = channel
            .basic_consume(&orders, ConsumeOptions::new())
            .await
            .expect("consume");
        broker.publish(&orders, DeliveryProperties::new(), "payload".into());

        let first = next_delivery(&mut subscription).await;
        channel
            .basic_nack(first.delivery_tag, false, true)
            .await
            .expect("nack");
        let second = next_delivery(&mut subscription).await;

        assert!(second.redelivered);
        assert_eq!(second.body, first.body);
        assert!(second.delivery_tag > first.delivery_tag);
    }

    /// Verify a nack without requeue discards the message.
    #[tokio::test]
    async fn test_nack_without_requeue_discards() {
        let broker = InMemoryBroker::new();
        let orders = queue("orders");
        broker.declare_queue(&orders);
        let channel = open_channel(&broker).await;
        let mut subscription = channel
            .basic_consume(&orders, ConsumeOptions::new())
            .await
            .expect("consume");
        broker.publish(&orders, DeliveryProperties::new(), "payload".into());

        let delivery = next_delivery(&mut subscription).await;
        channel
            .basic_nack(delivery.delivery_tag, false, false)
            .await
            .expect("nack");

        broker.set_open(false);
        assert_eq!(broker.ready_count(&orders), 0);
    }
}

// ============================================================================
// Failure Injection and Lifecycle Tests
// ============================================================================

mod failures {
    use super::*;

    /// Verify injected ack failures surface as broker errors.
    #[tokio::test]
    async fn test_fail_acks_injection() {
        let broker = InMemoryBroker::new();
        let orders = queue("orders");
        broker.declare_queue(&orders);
        let channel = open_channel(&broker).await;
        let mut subscription = channel
            .basic_consume(&orders, ConsumeOptions::new())
            .await
            .expect("consume");
        broker.publish(&orders, DeliveryProperties::new(), "payload".into());
        let delivery = next_delivery(&mut subscription).await;

        broker.fail_acks(true);
        let result = channel.basic_ack(delivery.delivery_tag, false).await;

        assert!(matches!(result, Err(ChannelError::Broker { .. })));
        assert!(broker.acks().is_empty(), "failed acks must not be recorded");

        // Recovery: once the injector is cleared the ack succeeds.
        broker.fail_acks(false);
        assert_ok!(channel.basic_ack(delivery.delivery_tag, false).await);
    }

    /// Verify operations fail while the broker is closed.
    #[tokio::test]
    async fn test_closed_broker_rejects_operations() {
        let broker = InMemoryBroker::new();
        let orders = queue("orders");
        broker.declare_queue(&orders);
        let channel = open_channel(&broker).await;

        broker.set_open(false);

        assert!(!channel.is_open());
        let result = channel.queue_declare_passive(&orders).await;
        assert!(matches!(result, Err(ChannelError::ConnectionClosed { .. })));
    }

    /// Verify closing the broker requeues in-flight deliveries for later
    /// redelivery.
    #[tokio::test]
    async fn test_close_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let orders = queue("orders");
        broker.declare_queue(&orders);
        let channel = open_channel(&broker).await;
        let mut subscription = channel
            .basic_consume(&orders, ConsumeOptions::new())
            .await
            .expect("consume");
        broker.publish(&orders, DeliveryProperties::new(), "payload".into());
        next_delivery(&mut subscription).await;

        broker.set_open(false);

        assert_eq!(broker.ready_count(&orders), 1);
    }

    /// Verify cancel detaches the consumer and confirms with cancel-ok.
    #[tokio::test]
    async fn test_cancel_confirms_and_detaches() {
        let broker = InMemoryBroker::new();
        let orders = queue("orders");
        broker.declare_queue(&orders);
        let channel = open_channel(&broker).await;
        let mut subscription = channel
            .basic_consume(&orders, ConsumeOptions::new())
            .await
            .expect("consume");
        match subscription.recv().await {
            Some(ConsumerEvent::ConsumeOk { .. }) => {}
            other => panic!("expected ConsumeOk, got {other:?}"),
        }

        let tag = subscription.consumer_tag().to_string();
        channel.basic_cancel(&tag).await.expect("cancel");

        match subscription.recv().await {
            Some(ConsumerEvent::CancelOk { consumer_tag }) => assert_eq!(consumer_tag, tag),
            other => panic!("expected CancelOk, got {other:?}"),
        }
        assert_eq!(broker.active_consumers(&orders), 0);
        assert_eq!(broker.cancels(), vec![tag]);
    }
}
