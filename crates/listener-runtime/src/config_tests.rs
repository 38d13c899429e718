//! Tests for the container configuration surface.

use super::*;
use std::io::Write;

// ============================================================================
// Default and Builder Tests
// ============================================================================

mod defaults {
    use super::*;

    /// Verify the documented default values.
    #[test]
    fn test_default_values() {
        let config = ContainerConfig::default();

        assert_eq!(config.consumers_per_queue, 1);
        assert_eq!(config.prefetch_count, 250);
        assert_eq!(config.messages_per_ack, 1);
        assert_eq!(config.ack_timeout_millis, 20_000);
        assert_eq!(config.monitor_interval_millis, 10_000);
        assert_eq!(config.declaration_retries, 3);
        assert_eq!(config.failed_declaration_retry_interval_millis, 5_000);
        assert_eq!(config.shutdown_timeout_millis, 5_000);
        assert_eq!(config.acknowledge_mode, AcknowledgeMode::Auto);
        assert!(config.validate().is_ok());
    }

    /// Verify builder methods update the targeted field only.
    #[test]
    fn test_builder_methods() {
        let config = ContainerConfig::new()
            .with_consumers_per_queue(3)
            .with_prefetch_count(50)
            .with_messages_per_ack(10)
            .with_ack_timeout_millis(500)
            .with_monitor_interval_millis(250)
            .with_shutdown_timeout_millis(1_000)
            .with_acknowledge_mode(AcknowledgeMode::Auto);

        assert_eq!(config.consumers_per_queue, 3);
        assert_eq!(config.prefetch_count, 50);
        assert_eq!(config.messages_per_ack, 10);
        assert_eq!(config.ack_timeout(), std::time::Duration::from_millis(500));
        assert_eq!(
            config.monitor_interval(),
            std::time::Duration::from_millis(250)
        );
        assert_eq!(
            config.shutdown_timeout(),
            std::time::Duration::from_millis(1_000)
        );
    }

    /// Verify the QoS value is the larger of prefetch and batch size, so a
    /// full batch always fits in the prefetch window.
    #[test]
    fn test_effective_prefetch() {
        let config = ContainerConfig::new()
            .with_prefetch_count(2)
            .with_messages_per_ack(10);
        assert_eq!(config.effective_prefetch(), 10);

        let config = ContainerConfig::new()
            .with_prefetch_count(100)
            .with_messages_per_ack(10);
        assert_eq!(config.effective_prefetch(), 100);
    }
}

// ============================================================================
// Validation Tests
// ============================================================================

mod validation {
    use super::*;

    /// Verify batched acks are rejected outside AUTO mode.
    #[test]
    fn test_batching_requires_auto_mode() {
        let config = ContainerConfig::new()
            .with_messages_per_ack(10)
            .with_acknowledge_mode(AcknowledgeMode::Manual);

        let result = config.validate();

        assert!(matches!(
            result,
            Err(ListenerError::InvalidConfiguration { .. })
        ));
    }

    /// Verify zero values for required settings are rejected.
    #[test]
    fn test_zero_values_rejected() {
        let zero_consumers = ContainerConfig::new().with_consumers_per_queue(0);
        assert!(zero_consumers.validate().is_err());

        let zero_batch = ContainerConfig::new().with_messages_per_ack(0);
        assert!(zero_batch.validate().is_err());

        let zero_monitor = ContainerConfig::new().with_monitor_interval_millis(0);
        assert!(zero_monitor.validate().is_err());

        let zero_shutdown = ContainerConfig::new().with_shutdown_timeout_millis(0);
        assert!(zero_shutdown.validate().is_err());
    }

    /// Verify a monitor interval above the ack timeout is allowed (logged,
    /// not fatal).
    #[test]
    fn test_slow_monitor_allowed() {
        let config = ContainerConfig::new()
            .with_monitor_interval_millis(30_000)
            .with_ack_timeout_millis(1_000);

        assert!(config.validate().is_ok());
    }
}

// ============================================================================
// Loading Tests
// ============================================================================

mod loading {
    use super::*;

    /// Verify loading with no file and no environment yields defaults.
    #[test]
    fn test_load_defaults() {
        let config = ContainerConfig::load(None).expect("load");

        assert_eq!(config.prefetch_count, 250);
        assert_eq!(config.acknowledge_mode, AcknowledgeMode::Auto);
    }

    /// Verify a TOML file overrides defaults.
    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        writeln!(
            file,
            "prefetch_count = 25\n\
             messages_per_ack = 5\n\
             acknowledge_mode = \"auto\"\n\
             [recovery]\n\
             initial_interval_millis = 100"
        )
        .expect("write config");
        let path = file.path().to_str().expect("utf-8 path").to_string();

        let config = ContainerConfig::load(Some(&path)).expect("load");

        assert_eq!(config.prefetch_count, 25);
        assert_eq!(config.messages_per_ack, 5);
        assert_eq!(config.recovery.initial_interval_millis, 100);
        // Untouched fields keep their defaults.
        assert_eq!(config.monitor_interval_millis, 10_000);
    }

    /// Verify a JSON file is accepted by extension.
    #[test]
    fn test_load_from_json_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("tempfile");
        let body = serde_json::json!({
            "consumers_per_queue": 2,
            "acknowledge_mode": "manual",
        });
        write!(file, "{body}").expect("write config");
        let path = file.path().to_str().expect("utf-8 path").to_string();

        let config = ContainerConfig::load(Some(&path)).expect("load");

        assert_eq!(config.consumers_per_queue, 2);
        assert_eq!(config.acknowledge_mode, AcknowledgeMode::Manual);
    }

    /// Verify an invalid file fails loudly instead of falling back to
    /// defaults.
    #[test]
    fn test_load_invalid_file_is_error() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        writeln!(file, "prefetch_count = \"not a number\"").expect("write config");
        let path = file.path().to_str().expect("utf-8 path").to_string();

        let result = ContainerConfig::load(Some(&path));

        assert!(matches!(
            result,
            Err(ListenerError::InvalidConfiguration { .. })
        ));
    }
}
