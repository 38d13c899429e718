//! Error classification for failed deliveries.
//!
//! A pure mapping from (handler error, delivery metadata, fatal-exception
//! policy) to a broker disposition. Nothing here touches the channel; the
//! consumer's dispatch path executes the returned outcome.

use crate::error::HandlerError;
use broker_channel::message::Delivery;
use std::sync::Arc;
use tracing::{error, warn};

#[cfg(test)]
#[path = "classifier_tests.rs"]
mod tests;

/// Broker disposition for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acknowledge; the delivery is done
    Ack,
    /// Negatively acknowledge with requeue; the broker will redeliver
    RequeueNack,
    /// The delivery is permanently unprocessable and must not be requeued
    RejectNoRequeue {
        /// Settle with an ack instead of a nack, discarding the message even
        /// when a dead-letter exchange would otherwise pick it up again
        discard_with_ack: bool,
    },
}

/// Policy deciding whether an error marks a delivery permanently
/// unprocessable
pub trait FatalExceptionStrategy: Send + Sync {
    fn is_fatal(&self, error: &HandlerError) -> bool;
}

/// Default strategy: conversion failures are fatal, everything else is
/// assumed transient
#[derive(Debug, Default)]
pub struct DefaultFatalExceptionStrategy;

impl FatalExceptionStrategy for DefaultFatalExceptionStrategy {
    fn is_fatal(&self, error: &HandlerError) -> bool {
        matches!(error, HandlerError::Conversion { .. })
    }
}

/// Classifier mapping handler errors to delivery outcomes.
///
/// Explicit disposition markers on the error short-circuit the fatal
/// strategy: a delivery already marked reject-no-requeue was handled
/// upstream and is not re-classified (or re-logged) here.
pub struct ConditionalRejectingClassifier {
    strategy: Arc<dyn FatalExceptionStrategy>,
    /// Discard (ack away) fatal deliveries that already carry dead-letter
    /// history, breaking redeliver loops between a DLQ and a retry topology
    discard_fatals_with_death: bool,
    /// Issue the reject on the application's behalf in MANUAL mode
    reject_manual: bool,
}

impl Default for ConditionalRejectingClassifier {
    fn default() -> Self {
        Self::new(Arc::new(DefaultFatalExceptionStrategy))
    }
}

impl ConditionalRejectingClassifier {
    /// Create a classifier with the given fatal-exception strategy
    pub fn new(strategy: Arc<dyn FatalExceptionStrategy>) -> Self {
        Self {
            strategy,
            discard_fatals_with_death: true,
            reject_manual: true,
        }
    }

    /// Control discarding of fatal deliveries with dead-letter history
    pub fn with_discard_fatals_with_death(mut self, discard: bool) -> Self {
        self.discard_fatals_with_death = discard;
        self
    }

    /// Control rejecting on the application's behalf in MANUAL mode
    pub fn with_reject_manual(mut self, reject: bool) -> Self {
        self.reject_manual = reject;
        self
    }

    /// Whether MANUAL-mode fatal deliveries are rejected by the container
    pub fn reject_manual(&self) -> bool {
        self.reject_manual
    }

    /// Classify a failed delivery.
    ///
    /// Logging here is part of the contract: every fatal classification is
    /// recorded with the original error before the outcome is final.
    pub fn classify(&self, delivery: &Delivery, error: &HandlerError) -> DeliveryOutcome {
        warn!(
            delivery_tag = delivery.delivery_tag,
            queue = %delivery.routing_key,
            error = %error,
            "Execution of message handler failed"
        );

        let effective = error.effective();

        match effective {
            // Disposition already decided upstream; do not re-classify.
            HandlerError::RejectNoRequeue { .. } => {
                DeliveryOutcome::RejectNoRequeue {
                    discard_with_ack: false,
                }
            }
            HandlerError::ImmediateAcknowledge { .. } => DeliveryOutcome::Ack,
            _ if self.strategy.is_fatal(effective) => {
                if self.discard_fatals_with_death && delivery.properties.has_death_history() {
                    error!(
                        delivery_tag = delivery.delivery_tag,
                        queue = %delivery.routing_key,
                        death_count = delivery.properties.death_count(),
                        error = %error,
                        "Dead-letter history detected on a message with a fatal error; \
                         perhaps requeued from a DLQ? - discarding"
                    );
                    DeliveryOutcome::RejectNoRequeue {
                        discard_with_ack: true,
                    }
                } else {
                    error!(
                        delivery_tag = delivery.delivery_tag,
                        queue = %delivery.routing_key,
                        error = %error,
                        "Fatal handler error; rejecting delivery without requeue"
                    );
                    DeliveryOutcome::RejectNoRequeue {
                        discard_with_ack: false,
                    }
                }
            }
            _ => DeliveryOutcome::RequeueNack,
        }
    }
}
