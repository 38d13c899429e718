//! Message and delivery types shared between the broker contracts and the
//! listener runtime, including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        // Validate length (AMQP short string)
        if name.is_empty() || name.len() > 255 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-255 characters".to_string(),
            });
        }

        // Validate characters (ASCII alphanumeric, hyphens, underscores, dots)
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores, and dots allowed"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Passive Declaration Result
// ============================================================================

/// Result of a passive queue declaration: confirms existence and reports
/// current depth without creating the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: QueueName,
    pub message_count: u32,
    pub consumer_count: u32,
}

// ============================================================================
// Delivery Types
// ============================================================================

/// One prior pass of a message through a dead-letter exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    /// Queue the message was dead-lettered from
    pub queue: String,
    /// Broker-reported reason (rejected, expired, maxlen)
    pub reason: String,
    /// Number of times this queue/reason pair occurred
    pub count: u32,
}

/// Broker properties attached to a delivery
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    /// Application headers; values keep their broker-side typing
    pub headers: HashMap<String, serde_json::Value>,
    /// Dead-letter history attached by the broker, oldest first
    pub death_history: Vec<DeathRecord>,
}

impl DeliveryProperties {
    /// Create empty properties
    pub fn new() -> Self {
        Self::default()
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: String) -> Self {
        self.content_type = Some(content_type);
        self
    }

    /// Set correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set message ID
    pub fn with_message_id(mut self, message_id: String) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Add an application header
    pub fn with_header(mut self, key: String, value: serde_json::Value) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Append a dead-letter history record
    pub fn with_death_record(mut self, record: DeathRecord) -> Self {
        self.death_history.push(record);
        self
    }

    /// Check if the broker reports this message was previously dead-lettered
    pub fn has_death_history(&self) -> bool {
        !self.death_history.is_empty()
    }

    /// Total number of prior dead-letter passes
    pub fn death_count(&self) -> u32 {
        self.death_history.iter().map(|record| record.count).sum()
    }
}

/// A message pushed to a consumer, alive between receipt and acknowledgment
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag of the consumer this delivery was routed to
    pub consumer_tag: String,
    /// Broker-assigned, monotonically increasing per channel
    pub delivery_tag: u64,
    /// Set when the broker is redelivering after a requeue
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: DeliveryProperties,
    pub body: Bytes,
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
