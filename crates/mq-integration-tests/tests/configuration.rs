//! Integration tests for loading queue and provisioning settings
//!
//! These tests verify:
//! - One settings file configures both the queue and its provisioning
//! - Selecting more than one backend is rejected by both crates
//! - Selecting no backend gives an in-memory queue but no provisioner

mod common;

use mq_infra::{new_infra, InfraBackend, InfraError, MqInfraConfig, MqInfraSettings, Policy};
use mq_runtime::{ConfigurationError, InMemoryConfig, QueueConfig, QueueSettings};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const ENV_PREFIX: &str = "MQ_IT_CONFIGURATION";

fn settings_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Verify a single file drives both the queue adapter and its provisioner
#[test]
fn test_shared_settings_file() {
    // Arrange
    common::init_tracing();
    let file = settings_file(
        r#"
retry_limit = 4
visibility_timeout_seconds = 20

[in_memory]
name = "orders"
"#,
    );

    // Act
    let queue = QueueConfig::try_from(QueueSettings::load(ENV_PREFIX, Some(file.path())).unwrap())
        .unwrap();
    let infra =
        MqInfraConfig::try_from(MqInfraSettings::load(ENV_PREFIX, Some(file.path())).unwrap())
            .unwrap();

    // Assert
    assert_eq!(queue, QueueConfig::InMemory(InMemoryConfig::new("orders")));
    assert_eq!(
        infra,
        MqInfraConfig::new(
            InfraBackend::InMemory(InMemoryConfig::new("orders")),
            Policy::new(Duration::from_secs(20), 4),
        )
    );
}

/// Verify two backend sections are rejected on both sides
#[test]
fn test_multiple_backends_rejected() {
    let file = settings_file(
        r#"
[in_memory]
name = "orders"

[rabbitmq]
server_url = "amqp://localhost"
queue = "orders"
"#,
    );

    let queue = QueueConfig::try_from(QueueSettings::load(ENV_PREFIX, Some(file.path())).unwrap());
    let infra =
        MqInfraConfig::try_from(MqInfraSettings::load(ENV_PREFIX, Some(file.path())).unwrap());

    assert!(matches!(queue, Err(ConfigurationError::Invalid { .. })));
    assert!(matches!(infra, Err(ConfigurationError::Invalid { .. })));
}

/// Verify an incomplete backend section names the missing key
#[test]
fn test_missing_required_field() {
    let file = settings_file(
        r#"
[rabbitmq]
queue = "orders"
"#,
    );

    let infra =
        MqInfraConfig::try_from(MqInfraSettings::load(ENV_PREFIX, Some(file.path())).unwrap());

    match infra {
        Err(ConfigurationError::Missing { key }) => assert_eq!(key, "rabbitmq.server_url"),
        other => panic!("expected missing key, got {:?}", other),
    }
}

/// Verify an empty configuration provisions nothing
#[tokio::test]
async fn test_no_backend_cannot_be_provisioned() {
    let file = settings_file("retry_limit = 1\n");

    let queue = QueueConfig::try_from(QueueSettings::load(ENV_PREFIX, Some(file.path())).unwrap())
        .unwrap();
    let infra =
        MqInfraConfig::try_from(MqInfraSettings::load(ENV_PREFIX, Some(file.path())).unwrap())
            .unwrap();

    assert!(matches!(queue, QueueConfig::InMemory(_)));
    assert!(infra.backend.is_none());
    assert!(matches!(
        new_infra(infra).declare().await,
        Err(InfraError::InvalidConfig)
    ));
}
