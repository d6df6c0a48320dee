//! Integration tests for the refresh grant against a token endpoint.

use chrono::{Duration as ChronoDuration, Utc};
use oauth2_token_lifecycle::{
    oauth2_config, refresh_config, AuthError, CallContext, ClientAuthMethod,
    InMemoryCredentialStore, OAuth2Config, OAuth2RefreshTransport, RefreshError,
    RefreshTransport, ReqwestHttpTransport, Token, TokenLifecycleManager,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer, auth_method: ClientAuthMethod) -> OAuth2Config {
    oauth2_config()
        .client_id("test-client-id")
        .client_secret("test-client-secret")
        .auth_method(auth_method)
        .authorization_endpoint(format!("{}/authorize", server.uri()))
        .token_endpoint(format!("{}/token", server.uri()))
        .build()
        .expect("Failed to build config")
}

fn refresh_transport(config: OAuth2Config) -> OAuth2RefreshTransport {
    let http = ReqwestHttpTransport::new().expect("Failed to build HTTP transport");
    OAuth2RefreshTransport::new(config, Arc::new(http))
}

#[tokio::test]
async fn test_refresh_grant_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=stored-refresh-token"))
        .and(body_string_contains("client_id=test-client-id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access-token",
            "token_type": "Bearer",
            "expires_in": 3599,
            "scope": "https://www.googleapis.com/auth/cloud-platform"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let transport = refresh_transport(config_for(&server, ClientAuthMethod::ClientSecretPost));
    let token = transport
        .refresh("stored-refresh-token", Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(token.access_token, "new-access-token");
    assert_eq!(token.refresh_token.as_deref(), Some("stored-refresh-token"));
    let remaining = token.time_to_expiry(Utc::now()).unwrap();
    assert!(remaining > ChronoDuration::minutes(59));
}

#[tokio::test]
async fn test_refresh_grant_basic_auth() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access-token",
            "refresh_token": "rotated-refresh-token",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let transport = refresh_transport(config_for(&server, ClientAuthMethod::ClientSecretBasic));
    let token = transport
        .refresh("stored-refresh-token", Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(token.refresh_token.as_deref(), Some("rotated-refresh-token"));
}

#[tokio::test]
async fn test_invalid_grant_is_terminal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&server)
        .await;

    let transport = refresh_transport(config_for(&server, ClientAuthMethod::ClientSecretPost));
    let error = transport
        .refresh("stored-refresh-token", Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        AuthError::Refresh(RefreshError::Terminal {
            status: Some(400),
            ..
        })
    ));
    assert!(!error.is_retryable());
    assert!(error.needs_reauth());
}

#[tokio::test]
async fn test_service_unavailable_is_transient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .mount(&server)
        .await;

    let transport = refresh_transport(config_for(&server, ClientAuthMethod::ClientSecretPost));
    let error = transport
        .refresh("stored-refresh-token", Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(error.is_retryable());
    assert!(error.to_string().contains("503"));
}

#[tokio::test]
async fn test_manager_retries_then_succeeds_against_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access-token",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryCredentialStore::with_token(
        Token::new("expired-access-token")
            .with_refresh_token("stored-refresh-token")
            .with_expiry(Utc::now() - ChronoDuration::hours(1)),
    ));
    let manager = TokenLifecycleManager::builder()
        .credential_store(store)
        .oauth2_config(config_for(&server, ClientAuthMethod::ClientSecretPost))
        .refresh_config(
            refresh_config()
                .retry_delays(Duration::from_millis(10), Duration::from_millis(40))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let token = manager.get_valid_token(&CallContext::new()).await.unwrap();

    assert_eq!(token.access_token, "new-access-token");
    assert_eq!(token.refresh_token.as_deref(), Some("stored-refresh-token"));
    assert_eq!(manager.get_refresh_state().consecutive_failures, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "new-access-token"}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let transport = refresh_transport(config_for(&server, ClientAuthMethod::ClientSecretPost));
    let error = transport
        .refresh("stored-refresh-token", Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(error.is_retryable(), "{:?}", error);
}
