use super::*;
use std::io::Write;

fn rabbitmq() -> RabbitMqConfig {
    RabbitMqConfig {
        server_url: "amqp://localhost:5672".to_string(),
        exchange: "events".to_string(),
        queue: "deliveries".to_string(),
        prefetch_count: None,
    }
}

fn azure() -> AzureServiceBusInfraConfig {
    AzureServiceBusInfraConfig {
        tenant_id: "tenant".to_string(),
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        subscription_id: "sub-id".to_string(),
        resource_group: "rg".to_string(),
        namespace: "ns".to_string(),
        topic: "orders".to_string(),
        subscription: "billing".to_string(),
        ..Default::default()
    }
}

mod selection_tests {
    use super::*;

    /// Verify a single section is selected and the policy carried over
    #[test]
    fn test_single_backend_selected() {
        let settings = MqInfraSettings {
            rabbitmq: Some(rabbitmq()),
            visibility_timeout_seconds: 30,
            retry_limit: 4,
            ..Default::default()
        };

        let config = MqInfraConfig::try_from(settings).unwrap();

        assert_eq!(config.backend, Some(InfraBackend::RabbitMq(rabbitmq())));
        assert_eq!(config.policy, Policy::new(Duration::from_secs(30), 4));
    }

    /// Verify two sections are rejected before any provisioning
    #[test]
    fn test_multiple_backends_rejected() {
        let settings = MqInfraSettings {
            rabbitmq: Some(rabbitmq()),
            in_memory: Some(InMemoryConfig::new("q")),
            ..Default::default()
        };

        let result = MqInfraConfig::try_from(settings);

        match result {
            Err(ConfigurationError::Invalid { message }) => {
                assert!(message.contains("rabbitmq"));
                assert!(message.contains("in_memory"));
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    /// Verify no section leaves the backend unset
    #[test]
    fn test_no_backend_is_none() {
        let config = MqInfraConfig::try_from(MqInfraSettings::default()).unwrap();

        assert_eq!(config.backend, None);
    }

    /// Verify the selected section is validated
    #[test]
    fn test_incomplete_azure_rejected() {
        let mut incomplete = azure();
        incomplete.resource_group.clear();
        let settings = MqInfraSettings {
            azure_service_bus: Some(incomplete),
            ..Default::default()
        };

        let result = MqInfraConfig::try_from(settings);

        assert!(matches!(
            result,
            Err(ConfigurationError::Missing { key }) if key == "azure_service_bus.resource_group"
        ));
    }
}

mod azure_config_tests {
    use super::*;

    /// Verify the management endpoint default and override
    #[test]
    fn test_management_endpoint() {
        let mut config = azure();
        assert_eq!(config.management_endpoint(), DEFAULT_MANAGEMENT_ENDPOINT);

        config.management_endpoint = Some("http://localhost:8080/".to_string());
        assert_eq!(config.management_endpoint(), "http://localhost:8080");
    }

    /// Verify the client secret is redacted
    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", azure());

        assert!(!rendered.contains("\"secret\""));
        assert!(rendered.contains("<redacted>"));
    }
}

mod policy_tests {
    use super::*;

    /// Verify zero visibility means unset and sub-second values truncate
    #[test]
    fn test_visibility_timeout_secs() {
        assert_eq!(Policy::default().visibility_timeout_secs(), None);
        assert_eq!(
            Policy::new(Duration::from_millis(500), 0).visibility_timeout_secs(),
            None
        );
        assert_eq!(
            Policy::new(Duration::from_secs(45), 0).visibility_timeout_secs(),
            Some(45)
        );
    }
}

mod load_tests {
    use super::*;

    /// Verify settings load from a YAML file
    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "retry_limit: 5\nvisibility_timeout_seconds: 20\nin_memory:\n  name: deliveries"
        )
        .unwrap();

        let settings = MqInfraSettings::load("MQ_INFRA_TEST_UNUSED", Some(file.path())).unwrap();
        let config = MqInfraConfig::try_from(settings).unwrap();

        assert_eq!(
            config.backend,
            Some(InfraBackend::InMemory(InMemoryConfig::new("deliveries")))
        );
        assert_eq!(config.policy.retry_limit, 5);
        assert_eq!(config.policy.visibility_timeout, Duration::from_secs(20));
    }
}
