//! Container controller: owns the queue set and the consumer registry.
//!
//! All membership state lives in one [`ContainerInner`] behind a single
//! mutex; only the controller's public operations and the recovery monitor
//! mutate it. Broker calls are made outside the lock and their results
//! committed under it.

use crate::classifier::ConditionalRejectingClassifier;
use crate::config::ContainerConfig;
use crate::consumer::QueueConsumer;
use crate::error::ListenerError;
use crate::handler::MessageHandler;
use crate::monitor;
use broker_channel::channel::{Connection, ConnectionProvider};
use broker_channel::message::QueueName;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[cfg(test)]
#[path = "container_tests.rs"]
mod tests;

/// Container lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerLifecycle {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ContainerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotStarted => "not-started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Restart gate for a queue whose consumer failed; holds the backoff state
pub(crate) struct RestartSchedule {
    pub(crate) eligible_at: Instant,
    pub(crate) attempt: u32,
}

/// Membership and registry state, mutated only under the container mutex
pub(crate) struct ContainerInner {
    pub(crate) lifecycle: ContainerLifecycle,
    /// Desired queue set, in configuration order
    pub(crate) queues: Vec<QueueName>,
    /// Active consumers per queue, one entry per concurrency slot
    pub(crate) consumers: HashMap<QueueName, Vec<Arc<QueueConsumer>>>,
    pub(crate) connection: Option<Arc<dyn Connection>>,
    /// Queues whose passive declaration failed, with the next retry time
    pub(crate) failed_declarations: HashMap<QueueName, Instant>,
    /// Queues waiting out a recovery backoff before respawning
    pub(crate) pending_restarts: HashMap<QueueName, RestartSchedule>,
    /// Queues with a reconciliation pass in flight
    pub(crate) reconciling: HashSet<QueueName>,
    pub(crate) monitor: Option<JoinHandle<()>>,
}

impl ContainerInner {
    fn new() -> Self {
        Self {
            lifecycle: ContainerLifecycle::NotStarted,
            queues: Vec::new(),
            consumers: HashMap::new(),
            connection: None,
            failed_declarations: HashMap::new(),
            pending_restarts: HashMap::new(),
            reconciling: HashSet::new(),
            monitor: None,
        }
    }

    /// Count consumers for a queue that are not terminally cancelled
    pub(crate) fn live_consumer_count(&self, queue: &QueueName) -> usize {
        self.consumers
            .get(queue)
            .map(|list| {
                list.iter()
                    .filter(|c| c.state() != crate::consumer::ConsumerState::Cancelled)
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Everything a consumer-spawning code path needs; cloned into the monitor
/// task and per-queue maintenance tasks
#[derive(Clone)]
pub(crate) struct ConsumerContext {
    pub(crate) connection_provider: Arc<dyn ConnectionProvider>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) classifier: Arc<ConditionalRejectingClassifier>,
    pub(crate) config: ContainerConfig,
    pub(crate) inner: Arc<Mutex<ContainerInner>>,
}

/// Message listener container: maintains long-running consumers on a set of
/// queues and supervises them through a periodic recovery monitor.
///
/// # Examples
///
/// ```rust,ignore
/// let container = MessageListenerContainer::new(broker, handler)
///     .with_config(ContainerConfig::default().with_prefetch_count(50));
/// container.add_queue_names(&["orders"])?;
/// container.start().await?;
/// // ...
/// container.stop().await?;
/// ```
pub struct MessageListenerContainer {
    connection_provider: Arc<dyn ConnectionProvider>,
    handler: Arc<dyn MessageHandler>,
    classifier: Arc<ConditionalRejectingClassifier>,
    config: ContainerConfig,
    inner: Arc<Mutex<ContainerInner>>,
}

impl MessageListenerContainer {
    /// Create a container with default configuration and classifier
    pub fn new(
        connection_provider: Arc<dyn ConnectionProvider>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            connection_provider,
            handler,
            classifier: Arc::new(ConditionalRejectingClassifier::default()),
            config: ContainerConfig::default(),
            inner: Arc::new(Mutex::new(ContainerInner::new())),
        }
    }

    /// Replace the configuration; applies to consumers created afterwards
    pub fn with_config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the error classifier
    pub fn with_classifier(mut self, classifier: ConditionalRejectingClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Current lifecycle state
    pub async fn lifecycle(&self) -> ContainerLifecycle {
        self.inner.lock().await.lifecycle
    }

    /// Queues the container is configured to consume, in order
    pub async fn queue_names(&self) -> Vec<QueueName> {
        self.inner.lock().await.queues.clone()
    }

    fn context(&self) -> ConsumerContext {
        ConsumerContext {
            connection_provider: Arc::clone(&self.connection_provider),
            handler: Arc::clone(&self.handler),
            classifier: Arc::clone(&self.classifier),
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Start the container: create one consumer per configured queue and
    /// concurrency slot, wait for each to report consuming, then begin
    /// monitoring.
    ///
    /// Fails when a queue cannot be passively declared within the
    /// declaration retry budget, or when consumers do not confirm within the
    /// shutdown timeout; a failed start leaves the container Stopped.
    pub async fn start(&self) -> Result<(), ListenerError> {
        self.config.validate()?;

        let queues = {
            let mut inner = self.inner.lock().await;
            match inner.lifecycle {
                ContainerLifecycle::NotStarted | ContainerLifecycle::Stopped => {}
                state => {
                    return Err(ListenerError::InvalidLifecycle {
                        state: state.to_string(),
                        required: "not-started or stopped".to_string(),
                    });
                }
            }
            inner.lifecycle = ContainerLifecycle::Starting;
            inner.queues.clone()
        };

        info!(queue_count = queues.len(), "Starting listener container");

        let connection = match self.connection_provider.create_connection().await {
            Ok(connection) => connection,
            Err(e) => {
                self.fail_start(Vec::new()).await;
                return Err(ListenerError::Channel(e));
            }
        };

        let mut started: Vec<Arc<QueueConsumer>> = Vec::new();
        for queue in &queues {
            for _slot in 0..self.config.consumers_per_queue {
                match self.subscribe_with_retry(&connection, queue).await {
                    Ok(consumer) => started.push(consumer),
                    Err(e) => {
                        self.fail_start(started).await;
                        return Err(e);
                    }
                }
            }
        }

        // All consumers must report consuming before the container is
        // Running; the shutdown timeout is the single deadline knob.
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        for consumer in &started {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            if !consumer.wait_consuming(remaining).await {
                warn!(
                    queue = %consumer.queue(),
                    "Consumer did not report consuming before the start deadline"
                );
                self.fail_start(started).await;
                return Err(ListenerError::StartTimedOut {
                    timeout_millis: self.config.shutdown_timeout_millis,
                });
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.lifecycle != ContainerLifecycle::Starting {
            // A concurrent stop won the race; undo the partial start.
            let state = inner.lifecycle;
            drop(inner);
            self.fail_start(started).await;
            return Err(ListenerError::InvalidLifecycle {
                state: state.to_string(),
                required: "starting".to_string(),
            });
        }
        for consumer in started {
            inner
                .consumers
                .entry(consumer.queue().clone())
                .or_default()
                .push(consumer);
        }
        inner.connection = Some(connection);
        inner.failed_declarations.clear();
        inner.pending_restarts.clear();
        inner.reconciling.clear();
        inner.monitor = Some(tokio::spawn(monitor::run_monitor(self.context())));
        inner.lifecycle = ContainerLifecycle::Running;
        info!("Listener container running");
        Ok(())
    }

    /// Stop the container within the configured shutdown timeout
    pub async fn stop(&self) -> Result<(), ListenerError> {
        self.stop_with_timeout(self.config.shutdown_timeout()).await
    }

    /// Stop the container, waiting up to `timeout` for graceful consumer
    /// cancellation.
    ///
    /// The timeout is authoritative: once it elapses every remaining
    /// consumer is torn down without confirmation and the container is
    /// Stopped regardless. Late broker confirmations are ignored.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<(), ListenerError> {
        let (consumers, monitor) = {
            let mut inner = self.inner.lock().await;
            match inner.lifecycle {
                ContainerLifecycle::Running | ContainerLifecycle::Starting => {}
                state => {
                    info!(state = %state, "Stop requested on a container that is not running");
                    return Ok(());
                }
            }
            inner.lifecycle = ContainerLifecycle::Stopping;
            let consumers: Vec<Arc<QueueConsumer>> =
                inner.consumers.drain().flat_map(|(_, list)| list).collect();
            let monitor = inner.monitor.take();
            inner.connection = None;
            inner.failed_declarations.clear();
            inner.pending_restarts.clear();
            (consumers, monitor)
        };

        if let Some(monitor) = monitor {
            monitor.abort();
        }

        info!(consumer_count = consumers.len(), "Stopping listener container");
        for consumer in &consumers {
            consumer.request_cancel();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for consumer in &consumers {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            if !consumer.wait_cancelled(remaining).await {
                warn!(
                    queue = %consumer.queue(),
                    consumer_tag = %consumer.consumer_tag(),
                    "Consumer did not confirm cancellation before the shutdown deadline"
                );
                consumer.force_cancel();
            }
        }

        self.inner.lock().await.lifecycle = ContainerLifecycle::Stopped;
        info!("Listener container stopped");
        Ok(())
    }

    /// Add queues to the desired set. Already-present names are ignored.
    /// While running, consumers are spawned immediately.
    pub async fn add_queue_names(&self, names: &[&str]) -> Result<(), ListenerError> {
        let parsed = Self::parse_queue_names(names)?;

        let (added, running) = {
            let mut inner = self.inner.lock().await;
            let mut added = Vec::new();
            for queue in parsed {
                if !inner.queues.contains(&queue) {
                    inner.queues.push(queue.clone());
                    added.push(queue);
                }
            }
            (added, inner.lifecycle == ContainerLifecycle::Running)
        };

        if !running || added.is_empty() {
            return Ok(());
        }

        let ctx = self.context();
        for queue in added {
            info!(queue = %queue, "Queue added while running; spawning consumers");
            monitor::reconcile_queue(&ctx, &queue).await;
        }
        Ok(())
    }

    /// Remove queues from the desired set and cancel their consumers.
    /// Absent names are ignored. When the channel is no longer open the
    /// removal is recorded without any broker interaction.
    pub async fn remove_queue_names(&self, names: &[&str]) -> Result<(), ListenerError> {
        let parsed = Self::parse_queue_names(names)?;

        let removed: Vec<Arc<QueueConsumer>> = {
            let mut inner = self.inner.lock().await;
            let mut removed = Vec::new();
            for queue in &parsed {
                inner.queues.retain(|q| q != queue);
                inner.failed_declarations.remove(queue);
                inner.pending_restarts.remove(queue);
                if let Some(list) = inner.consumers.remove(queue) {
                    removed.extend(list);
                }
            }
            removed
        };

        for consumer in removed {
            if consumer.channel_open() {
                consumer.cancel(self.config.shutdown_timeout()).await;
            } else {
                // Nothing can be sent on a dead channel; the removal is
                // bookkeeping only.
                info!(
                    queue = %consumer.queue(),
                    "Removing queue while not connected; skipping broker cancel"
                );
                consumer.force_cancel();
            }
        }
        Ok(())
    }

    fn parse_queue_names(names: &[&str]) -> Result<Vec<QueueName>, ListenerError> {
        names
            .iter()
            .map(|name| QueueName::new((*name).to_string()).map_err(ListenerError::from))
            .collect()
    }

    /// Subscribe one consumer, retrying declaration failures within the
    /// start-time budget
    async fn subscribe_with_retry(
        &self,
        connection: &Arc<dyn Connection>,
        queue: &QueueName,
    ) -> Result<Arc<QueueConsumer>, ListenerError> {
        let budget = self.config.declaration_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match QueueConsumer::subscribe(
                connection,
                queue.clone(),
                &self.config,
                Arc::clone(&self.handler),
                Arc::clone(&self.classifier),
            )
            .await
            {
                Ok(consumer) => return Ok(consumer),
                Err(ListenerError::DeclarationFailed { queue, source, .. }) => {
                    warn!(
                        queue = %queue,
                        attempt,
                        budget,
                        error = %source,
                        "Passive declaration failed during start"
                    );
                    if attempt >= budget {
                        return Err(ListenerError::DeclarationFailed {
                            queue,
                            attempts: attempt,
                            source,
                        });
                    }
                    tokio::time::sleep(self.config.failed_declaration_retry_interval()).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Undo a partial start: cancel whatever came up and return to Stopped
    async fn fail_start(&self, started: Vec<Arc<QueueConsumer>>) {
        for consumer in started {
            consumer.cancel(self.config.shutdown_timeout()).await;
        }
        let mut inner = self.inner.lock().await;
        inner.consumers.clear();
        inner.connection = None;
        inner.lifecycle = ContainerLifecycle::Stopped;
    }
}
