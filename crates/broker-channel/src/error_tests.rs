//! Tests for channel error classification.

use super::*;

/// Verify that connection and channel closures count as channel loss.
#[test]
fn test_closed_errors_are_channel_loss() {
    let connection = ChannelError::ConnectionClosed {
        message: "gone".to_string(),
    };
    let channel = ChannelError::ChannelClosed {
        message: "gone".to_string(),
    };

    assert!(connection.is_channel_loss());
    assert!(channel.is_channel_loss());
}

/// Verify that a broker refusal is treated as channel loss.
#[test]
fn test_broker_refusal_is_channel_loss() {
    let error = ChannelError::Broker {
        code: "bad-ack".to_string(),
        message: "unknown delivery tag".to_string(),
    };

    assert!(error.is_channel_loss());
    assert!(!error.is_declaration_failure());
}

/// Verify that a missing queue is a declaration failure, not channel loss.
#[test]
fn test_queue_not_found_is_declaration_failure() {
    let error = ChannelError::QueueNotFound {
        queue_name: "orders".to_string(),
    };

    assert!(error.is_declaration_failure());
    assert!(!error.is_channel_loss());
}

/// Verify error display formats include the relevant identifiers.
#[test]
fn test_error_display() {
    let error = ChannelError::QueueNotFound {
        queue_name: "orders".to_string(),
    };
    assert_eq!(error.to_string(), "Queue not found: orders");

    let error = ChannelError::ConsumerNotFound {
        consumer_tag: "ctag-1".to_string(),
    };
    assert_eq!(error.to_string(), "Consumer not found: ctag-1");
}
