//! Service Bus provisioning against wiremock stand-ins for Azure AD and
//! Resource Manager.

use super::*;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOPIC_PATH: &str =
    "/subscriptions/sub-id/resourceGroups/rg/providers/Microsoft.ServiceBus/namespaces/ns/topics/orders";
const SUBSCRIPTION_PATH: &str =
    "/subscriptions/sub-id/resourceGroups/rg/providers/Microsoft.ServiceBus/namespaces/ns/topics/orders/subscriptions/billing";

fn infra(server: &MockServer, policy: Policy) -> AzureServiceBusInfra {
    AzureServiceBusInfra::new(
        AzureServiceBusInfraConfig {
            tenant_id: "tenant-1".to_string(),
            client_id: "app-1".to_string(),
            client_secret: "secret".to_string(),
            subscription_id: "sub-id".to_string(),
            resource_group: "rg".to_string(),
            namespace: "ns".to_string(),
            topic: "orders".to_string(),
            subscription: "billing".to_string(),
            management_endpoint: Some(server.uri()),
            authority_host: Some(server.uri()),
        },
        policy,
    )
}

async fn mock_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/tenant-1/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "arm-token",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

fn not_found() -> ResponseTemplate {
    ResponseTemplate::new(404).set_body_json(serde_json::json!({
        "error": { "code": "ResourceNotFound", "message": "not found" }
    }))
}

async fn mock_entity(server: &MockServer, verb: &str, entity_path: &str, response: ResponseTemplate) {
    Mock::given(method(verb))
        .and(path(entity_path))
        .and(query_param("api-version", ARM_API_VERSION))
        .and(header("Authorization", "Bearer arm-token"))
        .respond_with(response)
        .mount(server)
        .await;
}

mod declare_tests {
    use super::*;
    use std::time::Duration;

    /// Verify a fresh declare creates the topic and a subscription carrying
    /// the translated delivery policy
    #[tokio::test]
    async fn test_declare_creates_topic_and_subscription() {
        // Arrange
        let server = MockServer::start().await;
        mock_token(&server).await;
        mock_entity(&server, "GET", TOPIC_PATH, not_found()).await;
        mock_entity(&server, "GET", SUBSCRIPTION_PATH, not_found()).await;
        Mock::given(method("PUT"))
            .and(path(TOPIC_PATH))
            .and(body_partial_json(serde_json::json!({
                "properties": {
                    "maxSizeInMegabytes": 1024,
                    "defaultMessageTimeToLive": "P14D",
                    "supportOrdering": true
                }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(SUBSCRIPTION_PATH))
            .and(body_partial_json(serde_json::json!({
                "properties": {
                    "lockDuration": "PT30S",
                    "maxDeliveryCount": 4,
                    "deadLetteringOnMessageExpiration": true,
                    "enableBatchedOperations": true
                }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        // Act
        let result = infra(&server, Policy::new(Duration::from_secs(30), 3))
            .declare()
            .await;

        // Assert
        assert!(result.is_ok(), "declare failed: {:?}", result.err());
    }

    /// Verify existing resources are left alone
    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let server = MockServer::start().await;
        mock_token(&server).await;
        mock_entity(&server, "GET", TOPIC_PATH, ResponseTemplate::new(200)).await;
        mock_entity(&server, "GET", SUBSCRIPTION_PATH, ResponseTemplate::new(200)).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let result = infra(&server, Policy::default()).declare().await;

        assert!(result.is_ok());
    }

    /// Verify a creation race lost with 409 counts as success
    #[tokio::test]
    async fn test_declare_tolerates_conflict() {
        let server = MockServer::start().await;
        mock_token(&server).await;
        mock_entity(&server, "GET", TOPIC_PATH, not_found()).await;
        mock_entity(&server, "PUT", TOPIC_PATH, ResponseTemplate::new(409)).await;
        mock_entity(&server, "GET", SUBSCRIPTION_PATH, ResponseTemplate::new(200)).await;

        let result = infra(&server, Policy::default()).declare().await;

        assert!(result.is_ok());
    }

    /// Verify other failures are returned
    #[tokio::test]
    async fn test_declare_returns_server_errors() {
        let server = MockServer::start().await;
        mock_token(&server).await;
        mock_entity(
            &server,
            "GET",
            TOPIC_PATH,
            ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "code": "InternalServerError", "message": "boom" }
            })),
        )
        .await;

        let result = infra(&server, Policy::default()).declare().await;

        match result {
            Err(InfraError::Azure { status, code, .. }) => {
                assert_eq!(status, 500);
                assert_eq!(code, "InternalServerError");
            }
            other => panic!("expected Azure error, got {:?}", other),
        }
    }

    /// Verify a rejected token request is an error before any ARM call
    #[tokio::test]
    async fn test_declare_with_bad_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = infra(&server, Policy::default()).declare().await;

        assert!(matches!(result, Err(InfraError::AzureCredential(_))));
    }
}

mod tear_down_tests {
    use super::*;

    /// Verify subscription and topic are deleted, tolerating absence
    #[tokio::test]
    async fn test_tear_down_tolerates_not_found() {
        let server = MockServer::start().await;
        mock_token(&server).await;
        mock_entity(&server, "DELETE", SUBSCRIPTION_PATH, not_found()).await;
        mock_entity(&server, "DELETE", TOPIC_PATH, ResponseTemplate::new(200)).await;

        let result = infra(&server, Policy::default()).tear_down().await;

        assert!(result.is_ok());
    }

    /// Verify exists is false when the subscription is missing
    #[tokio::test]
    async fn test_exists_needs_subscription() {
        let server = MockServer::start().await;
        mock_token(&server).await;
        mock_entity(&server, "GET", TOPIC_PATH, ResponseTemplate::new(200)).await;
        mock_entity(&server, "GET", SUBSCRIPTION_PATH, not_found()).await;

        let exists = infra(&server, Policy::default()).exists().await.unwrap();

        assert!(!exists);
    }
}
