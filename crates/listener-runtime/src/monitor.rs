//! Recovery monitor: the container's periodic health check.
//!
//! Each tick inspects every consumer independently, flushes stale ack
//! batches, retries failed declarations, processes restart backoff gates,
//! and reconciles the desired queue set against the running consumers.
//! Every broker wait is bounded by the monitor interval, and per-consumer
//! work runs in its own task so one stuck queue cannot starve the rest.

use crate::consumer::{ConsumerState, QueueConsumer};
use crate::container::{ConsumerContext, ContainerLifecycle, RestartSchedule};
use broker_channel::channel::Connection;
use broker_channel::message::QueueName;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Periodic monitor loop; aborted by the container on stop
pub(crate) async fn run_monitor(ctx: ConsumerContext) {
    let mut interval = tokio::time::interval(ctx.config.monitor_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the container just started
    // everything, so skip it.
    interval.tick().await;
    loop {
        interval.tick().await;
        monitor_tick(&ctx).await;
    }
}

async fn monitor_tick(ctx: &ConsumerContext) {
    let (consumers, desired, orphans) = {
        let mut inner = ctx.inner.lock().await;
        if inner.lifecycle != ContainerLifecycle::Running {
            return;
        }

        // Consumers for queues no longer desired (e.g. removed while the
        // container was still starting) are swept here.
        let desired = inner.queues.clone();
        let orphan_queues: Vec<QueueName> = inner
            .consumers
            .keys()
            .filter(|queue| !desired.contains(*queue))
            .cloned()
            .collect();
        let mut orphans = Vec::new();
        for queue in orphan_queues {
            if let Some(list) = inner.consumers.remove(&queue) {
                orphans.extend(list);
            }
        }

        let consumers: Vec<Arc<QueueConsumer>> = inner
            .consumers
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect();
        (consumers, desired, orphans)
    };

    for orphan in orphans {
        let timeout = ctx.config.shutdown_timeout();
        tokio::spawn(async move {
            if orphan.channel_open() {
                orphan.cancel(timeout).await;
            } else {
                orphan.force_cancel();
            }
        });
    }

    for consumer in consumers {
        if consumer.state() == ConsumerState::Cancelled {
            // The instance ended on its own (event stream closed, broker
            // cancel); retire it and schedule a replacement.
            retire_consumer(ctx, &consumer, true).await;
        } else if !consumer.channel_open() || consumer.ack_failed() {
            let task_ctx = ctx.clone();
            tokio::spawn(async move {
                cancel_and_retire(task_ctx, consumer).await;
            });
        } else {
            let ack_timeout = ctx.config.ack_timeout();
            tokio::spawn(async move {
                consumer.flush_stale(ack_timeout).await;
            });
        }
    }

    for queue in desired {
        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            reconcile_queue(&task_ctx, &queue).await;
        });
    }
}

/// Cancel an unhealthy consumer and schedule its replacement
async fn cancel_and_retire(ctx: ConsumerContext, consumer: Arc<QueueConsumer>) {
    let idle_seconds =
        (chrono::Utc::now() - consumer.last_activity().as_datetime()).num_seconds();
    warn!(
        queue = %consumer.queue(),
        consumer_tag = %consumer.consumer_tag(),
        channel_open = consumer.channel_open(),
        ack_failed = consumer.ack_failed(),
        idle_seconds,
        "Consumer unhealthy; cancelling for replacement"
    );
    consumer.cancel(ctx.config.shutdown_timeout()).await;
    retire_consumer(&ctx, &consumer, true).await;
}

/// Drop a consumer from the registry; optionally gate its queue behind the
/// recovery backoff before a replacement is spawned
async fn retire_consumer(ctx: &ConsumerContext, consumer: &Arc<QueueConsumer>, schedule: bool) {
    let mut inner = ctx.inner.lock().await;
    let queue = consumer.queue().clone();
    let now_empty = match inner.consumers.get_mut(&queue) {
        Some(list) => {
            list.retain(|c| !Arc::ptr_eq(c, consumer));
            list.is_empty()
        }
        None => false,
    };
    if now_empty {
        inner.consumers.remove(&queue);
    }
    if schedule && inner.queues.contains(&queue) && !inner.pending_restarts.contains_key(&queue) {
        let delay = ctx.config.recovery.calculate_delay(0);
        debug!(
            queue = %queue,
            delay_millis = delay.as_millis() as u64,
            "Scheduling consumer replacement"
        );
        inner.pending_restarts.insert(
            queue,
            RestartSchedule {
                eligible_at: Instant::now() + delay,
                attempt: 1,
            },
        );
    }
}

/// Bring a queue's consumer count up to the configured concurrency, honoring
/// declaration-retry and restart-backoff gates. Also used by
/// `add_queue_names` for immediate spawning.
pub(crate) async fn reconcile_queue(ctx: &ConsumerContext, queue: &QueueName) {
    let connection_hint = {
        let mut inner = ctx.inner.lock().await;
        if inner.lifecycle != ContainerLifecycle::Running
            || !inner.queues.contains(queue)
            || inner.reconciling.contains(queue)
        {
            return;
        }
        let now = Instant::now();
        if inner
            .failed_declarations
            .get(queue)
            .is_some_and(|next| *next > now)
        {
            return;
        }
        if inner
            .pending_restarts
            .get(queue)
            .is_some_and(|gate| gate.eligible_at > now)
        {
            return;
        }
        if inner.live_consumer_count(queue) >= ctx.config.consumers_per_queue as usize {
            inner.failed_declarations.remove(queue);
            inner.pending_restarts.remove(queue);
            return;
        }
        inner.reconciling.insert(queue.clone());
        inner.connection.clone()
    };

    spawn_for_queue(ctx, queue, connection_hint).await;

    ctx.inner.lock().await.reconciling.remove(queue);
}

async fn spawn_for_queue(
    ctx: &ConsumerContext,
    queue: &QueueName,
    connection_hint: Option<Arc<dyn Connection>>,
) {
    // Every broker wait below is bounded so a stuck call cannot hold the
    // queue's reconciliation slot past a tick cycle.
    let bound = ctx.config.monitor_interval();

    let connection = match connection_hint.filter(|connection| connection.is_open()) {
        Some(connection) => connection,
        None => {
            match tokio::time::timeout(bound, ctx.connection_provider.create_connection()).await {
                Ok(Ok(connection)) => {
                    ctx.inner.lock().await.connection = Some(Arc::clone(&connection));
                    connection
                }
                Ok(Err(e)) => {
                    schedule_backoff(ctx, queue, &format!("connection failed: {e}")).await;
                    return;
                }
                Err(_) => {
                    schedule_backoff(ctx, queue, "connection attempt timed out").await;
                    return;
                }
            }
        }
    };

    loop {
        let missing = {
            let mut inner = ctx.inner.lock().await;
            if inner.lifecycle != ContainerLifecycle::Running || !inner.queues.contains(queue) {
                return;
            }
            let live = inner.live_consumer_count(queue);
            let target = ctx.config.consumers_per_queue as usize;
            if live >= target {
                inner.failed_declarations.remove(queue);
                inner.pending_restarts.remove(queue);
                return;
            }
            target - live
        };
        debug!(queue = %queue, missing, "Spawning replacement consumers");

        let subscribe = QueueConsumer::subscribe(
            &connection,
            queue.clone(),
            &ctx.config,
            Arc::clone(&ctx.handler),
            Arc::clone(&ctx.classifier),
        );
        match tokio::time::timeout(bound, subscribe).await {
            Ok(Ok(consumer)) => {
                let stale = {
                    let mut inner = ctx.inner.lock().await;
                    if inner.lifecycle == ContainerLifecycle::Running
                        && inner.queues.contains(queue)
                    {
                        inner.failed_declarations.remove(queue);
                        inner.pending_restarts.remove(queue);
                        inner
                            .consumers
                            .entry(queue.clone())
                            .or_default()
                            .push(Arc::clone(&consumer));
                        None
                    } else {
                        Some(consumer)
                    }
                };
                // The queue was removed (or the container stopped) while we
                // were subscribing; undo it.
                if let Some(consumer) = stale {
                    consumer.cancel(ctx.config.shutdown_timeout()).await;
                    return;
                }
                if missing == 1 {
                    return;
                }
            }
            Ok(Err(crate::error::ListenerError::DeclarationFailed { source, .. })) => {
                let retry_at = Instant::now() + ctx.config.failed_declaration_retry_interval();
                warn!(
                    queue = %queue,
                    error = %source,
                    retry_millis = ctx.config.failed_declaration_retry_interval_millis,
                    "Passive declaration failed; queue stays un-consumed until it succeeds"
                );
                ctx.inner
                    .lock()
                    .await
                    .failed_declarations
                    .insert(queue.clone(), retry_at);
                return;
            }
            Ok(Err(e)) => {
                schedule_backoff(ctx, queue, &format!("subscribe failed: {e}")).await;
                return;
            }
            Err(_) => {
                schedule_backoff(ctx, queue, "subscribe timed out").await;
                return;
            }
        }
    }
}

/// Push the queue's restart gate out by the next backoff step
async fn schedule_backoff(ctx: &ConsumerContext, queue: &QueueName, reason: &str) {
    let mut inner = ctx.inner.lock().await;
    let attempt = inner
        .pending_restarts
        .get(queue)
        .map(|gate| gate.attempt)
        .unwrap_or(0);
    let delay = ctx.config.recovery.calculate_delay(attempt);
    warn!(
        queue = %queue,
        attempt,
        delay_millis = delay.as_millis() as u64,
        reason,
        "Consumer restart failed; backing off"
    );
    inner.pending_restarts.insert(
        queue.clone(),
        RestartSchedule {
            eligible_at: Instant::now() + delay,
            attempt: attempt + 1,
        },
    );
}
