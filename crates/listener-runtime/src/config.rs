//! Container configuration surface.
//!
//! All settings carry defaults, so an entirely unconfigured container is
//! valid. Interval settings are plain millisecond counts with `Duration`
//! accessors; this keeps the serde surface flat for file and environment
//! sources.

use crate::error::ListenerError;
use crate::retry::RecoveryPolicy;
use serde::Deserialize;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// How deliveries are acknowledged back to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcknowledgeMode {
    /// The container acknowledges after the handler returns (default)
    #[default]
    Auto,
    /// The application acknowledges through a [`crate::handler::ManualAckHandle`]
    Manual,
    /// The broker acknowledges on delivery; nothing is sent back
    None,
}

impl AcknowledgeMode {
    /// Check if the container is responsible for acknowledgments
    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }

    /// Check if the broker auto-acks at consume time
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Configuration for a message listener container
///
/// # Examples
///
/// ```rust
/// use listener_runtime::config::ContainerConfig;
///
/// let config = ContainerConfig::default()
///     .with_prefetch_count(50)
///     .with_messages_per_ack(10)
///     .with_ack_timeout_millis(500);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Number of consumers created per queue
    pub consumers_per_queue: u16,

    /// Maximum unacknowledged deliveries per channel
    pub prefetch_count: u16,

    /// Deliveries acknowledged with one cumulative ack; 1 acks every delivery
    pub messages_per_ack: u32,

    /// Pending batched acks older than this are flushed by the monitor
    pub ack_timeout_millis: u64,

    /// Interval between recovery monitor ticks
    pub monitor_interval_millis: u64,

    /// Attempts to passively declare each queue during start
    pub declaration_retries: u32,

    /// Interval between declaration retries, at start and at runtime
    pub failed_declaration_retry_interval_millis: u64,

    /// Backoff schedule for replacing failed consumers
    pub recovery: RecoveryPolicy,

    /// Deadline for graceful shutdown and cancel confirmations
    pub shutdown_timeout_millis: u64,

    /// Acknowledgment mode
    pub acknowledge_mode: AcknowledgeMode,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            consumers_per_queue: 1,
            prefetch_count: 250,
            messages_per_ack: 1,
            ack_timeout_millis: 20_000,
            monitor_interval_millis: 10_000,
            declaration_retries: 3,
            failed_declaration_retry_interval_millis: 5_000,
            recovery: RecoveryPolicy::default(),
            shutdown_timeout_millis: 5_000,
            acknowledge_mode: AcknowledgeMode::default(),
        }
    }
}

impl ContainerConfig {
    /// Create configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of consumers per queue
    pub fn with_consumers_per_queue(mut self, count: u16) -> Self {
        self.consumers_per_queue = count;
        self
    }

    /// Set the prefetch count
    pub fn with_prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Set the number of deliveries per cumulative ack
    pub fn with_messages_per_ack(mut self, count: u32) -> Self {
        self.messages_per_ack = count;
        self
    }

    /// Set the ack timeout in milliseconds
    pub fn with_ack_timeout_millis(mut self, millis: u64) -> Self {
        self.ack_timeout_millis = millis;
        self
    }

    /// Set the monitor interval in milliseconds
    pub fn with_monitor_interval_millis(mut self, millis: u64) -> Self {
        self.monitor_interval_millis = millis;
        self
    }

    /// Set the declaration retry budget used during start
    pub fn with_declaration_retries(mut self, retries: u32) -> Self {
        self.declaration_retries = retries;
        self
    }

    /// Set the declaration retry interval in milliseconds
    pub fn with_failed_declaration_retry_interval_millis(mut self, millis: u64) -> Self {
        self.failed_declaration_retry_interval_millis = millis;
        self
    }

    /// Set the recovery backoff policy
    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    /// Set the shutdown timeout in milliseconds
    pub fn with_shutdown_timeout_millis(mut self, millis: u64) -> Self {
        self.shutdown_timeout_millis = millis;
        self
    }

    /// Set the acknowledgment mode
    pub fn with_acknowledge_mode(mut self, mode: AcknowledgeMode) -> Self {
        self.acknowledge_mode = mode;
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_millis)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_millis)
    }

    pub fn failed_declaration_retry_interval(&self) -> Duration {
        Duration::from_millis(self.failed_declaration_retry_interval_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_millis)
    }

    /// QoS value sent on each consumer channel: a full ack batch must fit in
    /// the prefetch window, so the larger of the two settings wins.
    pub fn effective_prefetch(&self) -> u16 {
        let messages_per_ack = self.messages_per_ack.min(u16::MAX as u32) as u16;
        self.prefetch_count.max(messages_per_ack)
    }

    /// Validate the configuration
    ///
    /// Batched acknowledgment requires the container to own the ack path, so
    /// `messages_per_ack > 1` is rejected for MANUAL and NONE modes. A
    /// monitor interval above the ack timeout is allowed but makes timeout
    /// flushes late, so it is logged.
    pub fn validate(&self) -> Result<(), ListenerError> {
        if self.consumers_per_queue == 0 {
            return Err(ListenerError::InvalidConfiguration {
                message: "consumers_per_queue must be at least 1".to_string(),
            });
        }
        if self.messages_per_ack == 0 {
            return Err(ListenerError::InvalidConfiguration {
                message: "messages_per_ack must be at least 1".to_string(),
            });
        }
        if self.messages_per_ack > 1 && !self.acknowledge_mode.is_auto() {
            return Err(ListenerError::InvalidConfiguration {
                message: "messages_per_ack requires acknowledge_mode = auto".to_string(),
            });
        }
        if self.monitor_interval_millis == 0 {
            return Err(ListenerError::InvalidConfiguration {
                message: "monitor_interval_millis must be positive".to_string(),
            });
        }
        if self.shutdown_timeout_millis == 0 {
            return Err(ListenerError::InvalidConfiguration {
                message: "shutdown_timeout_millis must be positive".to_string(),
            });
        }
        if self.monitor_interval_millis > self.ack_timeout_millis {
            tracing::warn!(
                monitor_interval_millis = self.monitor_interval_millis,
                ack_timeout_millis = self.ack_timeout_millis,
                "Monitor interval exceeds ack timeout; timeout flushes will be late"
            );
        }
        Ok(())
    }

    /// Load configuration from an optional file and the environment.
    ///
    /// Sources (applied in order — later sources override earlier ones):
    ///  1. The file at `file_path`, when given (format by extension)
    ///  2. Environment variables prefixed `LISTENER__`
    ///     (double-underscore separator), e.g.
    ///     `LISTENER__PREFETCH_COUNT=50` sets `prefetch_count = 50`
    ///
    /// All fields carry serde defaults, so an absent file and an empty
    /// environment produce the built-in defaults. A malformed file or a
    /// value that cannot be coerced IS a hard error because it indicates
    /// deliberate-but-broken operator configuration.
    pub fn load(file_path: Option<&str>) -> Result<Self, ListenerError> {
        let mut builder = config::Config::builder();

        if let Some(path) = file_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("LISTENER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ListenerError::InvalidConfiguration {
                message: format!("failed to assemble configuration sources: {e}"),
            })?;

        let loaded: Self =
            settings
                .try_deserialize()
                .map_err(|e| ListenerError::InvalidConfiguration {
                    message: format!("failed to deserialize configuration: {e}"),
                })?;

        loaded.validate()?;
        Ok(loaded)
    }
}
