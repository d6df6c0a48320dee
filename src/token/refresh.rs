//! Refresh Transport
//!
//! The refresh-token grant (RFC 6749 section 6) behind a trait seam.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use secrecy::ExposeSecret;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::core::{HttpRequest, HttpTransport};
use crate::error::{create_error_from_response, AuthError, AuthResult, TransportError};
use crate::types::{ClientAuthMethod, OAuth2Config, Token, TokenResponse};

/// Exchanges a refresh value for a new token.
///
/// Implementations report failures through the [`AuthError`] taxonomy so the
/// retry policy can classify them. A returned token without a refresh value is
/// fine; the caller carries the previous one over.
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    /// Perform one refresh exchange bounded by `timeout`.
    async fn refresh(&self, refresh_token: &str, timeout: Duration) -> AuthResult<Token>;
}

/// Refresh transport talking to an OAuth2 token endpoint.
pub struct OAuth2RefreshTransport {
    config: OAuth2Config,
    transport: Arc<dyn HttpTransport>,
}

impl OAuth2RefreshTransport {
    /// Create a transport for `config`'s token endpoint.
    pub fn new(config: OAuth2Config, transport: Arc<dyn HttpTransport>) -> Self {
        Self { config, transport }
    }

    fn build_body(&self, refresh_token: &str) -> String {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("grant_type", "refresh_token");
        form.append_pair("refresh_token", refresh_token);

        let credentials = &self.config.credentials;
        if credentials.auth_method != ClientAuthMethod::ClientSecretBasic {
            form.append_pair("client_id", &credentials.client_id);
        }
        if credentials.auth_method == ClientAuthMethod::ClientSecretPost {
            if let Some(secret) = &credentials.client_secret {
                form.append_pair("client_secret", secret.expose_secret());
            }
        }

        form.finish()
    }

    fn build_request(&self, refresh_token: &str, timeout: Duration) -> HttpRequest {
        let mut request = HttpRequest::post(&self.config.provider.token_endpoint)
            .header("content-type", "application/x-www-form-urlencoded")
            .header("accept", "application/json")
            .body(self.build_body(refresh_token))
            .timeout(timeout);

        let credentials = &self.config.credentials;
        if credentials.auth_method == ClientAuthMethod::ClientSecretBasic {
            if let Some(secret) = &credentials.client_secret {
                let pair = format!("{}:{}", credentials.client_id, secret.expose_secret());
                let encoded = base64::engine::general_purpose::STANDARD.encode(pair);
                request = request.header("authorization", format!("Basic {}", encoded));
            }
        }

        request
    }
}

#[async_trait]
impl RefreshTransport for OAuth2RefreshTransport {
    async fn refresh(&self, refresh_token: &str, timeout: Duration) -> AuthResult<Token> {
        let request = self.build_request(refresh_token, timeout);
        debug!(endpoint = %self.config.provider.token_endpoint, "sending refresh grant");

        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(create_error_from_response(response.status, &response.body));
        }

        let token_response: TokenResponse =
            serde_json::from_str(&response.body).map_err(|e| TransportError::InvalidResponse {
                message: format!("token response: {}", e),
            })?;

        Ok(token_response.into_token(Some(refresh_token), Utc::now()))
    }
}

/// Mock refresh transport for testing.
///
/// Returns queued results first-in first-out, then the default result.
#[derive(Default)]
pub struct MockRefreshTransport {
    results: Mutex<Vec<AuthResult<Token>>>,
    default_result: Mutex<Option<AuthResult<Token>>>,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockRefreshTransport {
    /// Create new mock refresh transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful refresh.
    pub fn queue_token(&self, token: Token) -> &Self {
        lock(&self.results).push(Ok(token));
        self
    }

    /// Queue a failed refresh.
    pub fn queue_error(&self, error: AuthError) -> &Self {
        lock(&self.results).push(Err(error));
        self
    }

    /// Result returned once the queue is empty.
    pub fn set_default_result(&self, result: AuthResult<Token>) -> &Self {
        *lock(&self.default_result) = Some(result);
        self
    }

    /// Make every exchange take `delay`.
    pub fn set_delay(&self, delay: Duration) -> &Self {
        *lock(&self.delay) = Some(delay);
        self
    }

    /// Number of exchanges performed.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Refresh values received, in call order.
    pub fn get_calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl RefreshTransport for MockRefreshTransport {
    async fn refresh(&self, refresh_token: &str, _timeout: Duration) -> AuthResult<Token> {
        lock(&self.calls).push(refresh_token.to_string());

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = {
            let mut results = lock(&self.results);
            if results.is_empty() {
                None
            } else {
                Some(results.remove(0))
            }
        };

        match queued {
            Some(result) => result,
            None => lock(&self.default_result).clone().unwrap_or_else(|| {
                Err(TransportError::ConnectionFailed {
                    message: "No mock refresh result available".to_string(),
                }
                .into())
            }),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HttpResponse, MockHttpTransport};
    use crate::error::RefreshError;
    use crate::types::ClientCredentials;
    use secrecy::SecretString;

    fn config(auth_method: ClientAuthMethod) -> OAuth2Config {
        OAuth2Config {
            credentials: ClientCredentials {
                client_id: "client-id".to_string(),
                client_secret: Some(SecretString::new("client-secret".to_string())),
                auth_method,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_refresh_post_auth() {
        let http = Arc::new(MockHttpTransport::new());
        http.queue_json_response(
            200,
            &serde_json::json!({
                "access_token": "new-access-token",
                "token_type": "Bearer",
                "expires_in": 3600
            }),
        );

        let transport =
            OAuth2RefreshTransport::new(config(ClientAuthMethod::ClientSecretPost), http.clone());
        let token = transport
            .refresh("old refresh/value", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(token.access_token, "new-access-token");
        assert_eq!(token.refresh_token.as_deref(), Some("old refresh/value"));
        assert!(token.expiry.is_some());

        let request = http.get_last_request().unwrap();
        let body = request.body.unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=old+refresh%2Fvalue"));
        assert!(body.contains("client_secret=client-secret"));
        assert!(!request.headers.contains_key("authorization"));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_refresh_basic_auth() {
        let http = Arc::new(MockHttpTransport::new());
        http.queue_json_response(200, &serde_json::json!({"access_token": "new-access-token"}));

        let transport =
            OAuth2RefreshTransport::new(config(ClientAuthMethod::ClientSecretBasic), http.clone());
        transport
            .refresh("refresh-token-value", Duration::from_secs(5))
            .await
            .unwrap();

        let request = http.get_last_request().unwrap();
        assert!(request
            .headers
            .get("authorization")
            .unwrap()
            .starts_with("Basic "));
        assert!(!request.body.unwrap().contains("client_secret"));
    }

    #[tokio::test]
    async fn test_refresh_error_classification() {
        let http = Arc::new(MockHttpTransport::new());
        http.queue_json_response(
            400,
            &serde_json::json!({"error": "invalid_grant", "error_description": "revoked"}),
        );
        http.queue_response(HttpResponse {
            status: 503,
            headers: Default::default(),
            body: "Service Unavailable".to_string(),
        });

        let transport =
            OAuth2RefreshTransport::new(config(ClientAuthMethod::ClientSecretPost), http);

        let error = transport
            .refresh("refresh-token-value", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            AuthError::Refresh(RefreshError::Terminal { .. })
        ));

        let error = transport
            .refresh("refresh-token-value", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_mock_refresh_transport() {
        let mock = MockRefreshTransport::new();
        mock.queue_token(Token::new("first-access-token"));
        mock.set_default_result(Ok(Token::new("default-access-token")));

        let first = mock.refresh("r1", Duration::from_secs(1)).await.unwrap();
        let second = mock.refresh("r2", Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.access_token, "first-access-token");
        assert_eq!(second.access_token, "default-access-token");
        assert_eq!(mock.get_calls(), vec!["r1", "r2"]);
    }
}
