//! Configuration Builders
//!
//! Fluent builders for the OAuth2 client configuration and the refresh tuning.

use secrecy::SecretString;
use std::time::Duration;

use crate::error::{AuthError, ConfigurationError};
use crate::types::{
    ClientAuthMethod, ClientCredentials, OAuth2Config, ProviderConfig, RefreshConfig,
    DEFAULT_TIMEOUT,
};

/// OAuth2 configuration builder.
#[derive(Default)]
pub struct OAuth2ConfigBuilder {
    client_id: Option<String>,
    client_secret: Option<SecretString>,
    auth_method: Option<ClientAuthMethod>,
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    scopes: Vec<String>,
    timeout: Duration,
}

impl OAuth2ConfigBuilder {
    /// Create new configuration builder.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            ..Default::default()
        }
    }

    /// Set client ID.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set client secret.
    pub fn client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(SecretString::new(client_secret.into()));
        self
    }

    /// Set client authentication method.
    pub fn auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.auth_method = Some(method);
        self
    }

    /// Set authorization endpoint.
    pub fn authorization_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.authorization_endpoint = Some(endpoint.into());
        self
    }

    /// Set token endpoint.
    pub fn token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    /// Use both endpoints of `provider`.
    pub fn from_provider_config(mut self, provider: ProviderConfig) -> Self {
        self.authorization_endpoint = Some(provider.authorization_endpoint);
        self.token_endpoint = Some(provider.token_endpoint);
        self
    }

    /// Use the Google endpoints.
    pub fn google(self) -> Self {
        self.from_provider_config(ProviderConfig::default())
    }

    /// Set scopes.
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Add a scope.
    pub fn add_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// Set request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the OAuth2 configuration.
    pub fn build(self) -> Result<OAuth2Config, AuthError> {
        let client_id = self
            .client_id
            .filter(|id| !id.is_empty())
            .ok_or(ConfigurationError::MissingField { field: "client_id" })?;

        let authorization_endpoint = self.authorization_endpoint.ok_or(
            ConfigurationError::MissingField {
                field: "authorization_endpoint",
            },
        )?;
        let token_endpoint = self.token_endpoint.ok_or(ConfigurationError::MissingField {
            field: "token_endpoint",
        })?;
        validate_endpoint(&authorization_endpoint)?;
        validate_endpoint(&token_endpoint)?;

        let auth_method = self.auth_method.unwrap_or_default();

        // Secret-based methods cannot authenticate without a secret.
        if matches!(
            auth_method,
            ClientAuthMethod::ClientSecretBasic | ClientAuthMethod::ClientSecretPost
        ) && self.client_secret.is_none()
        {
            return Err(ConfigurationError::MissingField {
                field: "client_secret",
            }
            .into());
        }

        if self.timeout.is_zero() {
            return Err(ConfigurationError::InvalidValue {
                field: "timeout",
                message: "must be positive".to_string(),
            }
            .into());
        }

        Ok(OAuth2Config {
            credentials: ClientCredentials {
                client_id,
                client_secret: self.client_secret,
                auth_method,
            },
            provider: ProviderConfig {
                authorization_endpoint,
                token_endpoint,
            },
            scopes: self.scopes,
            timeout: self.timeout,
        })
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), ConfigurationError> {
    let invalid = || ConfigurationError::InvalidEndpoint {
        url: endpoint.to_string(),
    };
    let url = url::Url::parse(endpoint).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "https" | "http") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(())
}

/// Create a new OAuth2 configuration builder.
pub fn oauth2_config() -> OAuth2ConfigBuilder {
    OAuth2ConfigBuilder::new()
}

/// Refresh configuration builder.
///
/// Starts from [`RefreshConfig::default`]; `build` validates the result.
#[derive(Debug, Clone, Default)]
pub struct RefreshConfigBuilder {
    config: RefreshConfig,
}

impl RefreshConfigBuilder {
    /// Create new refresh configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of the estimated lifetime after which the background task renews.
    pub fn background_refresh_threshold(mut self, threshold: f64) -> Self {
        self.config.background_refresh_threshold = threshold;
        self
    }

    /// Maximum refresh attempts.
    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_max_attempts = attempts;
        self
    }

    /// Base and maximum backoff delay.
    pub fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.retry_base_delay = base;
        self.config.retry_max_delay = max;
        self
    }

    /// Backoff multiplier.
    pub fn retry_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry_multiplier = multiplier;
        self
    }

    /// Jitter fraction.
    pub fn jitter_percent(mut self, jitter: f64) -> Self {
        self.config.jitter_percent = jitter;
        self
    }

    /// Grace period after expiry.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.config.grace_period = grace_period;
        self
    }

    /// Background check interval.
    pub fn background_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.background_refresh_interval = interval;
        self
    }

    /// How long to wait for an in-flight refresh.
    pub fn refresh_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.refresh_lock_timeout = timeout;
        self
    }

    /// Expiry safety margin.
    pub fn token_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.config.token_refresh_threshold = threshold;
        self
    }

    /// Bound on one refresh exchange.
    pub fn token_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.config.token_refresh_timeout = timeout;
        self
    }

    /// Cache validity window.
    pub fn cache_validity(mut self, validity: Duration) -> Self {
        self.config.cache_validity = validity;
        self
    }

    /// Per-tick bound for background work.
    pub fn background_tick_timeout(mut self, timeout: Duration) -> Self {
        self.config.background_tick_timeout = timeout;
        self
    }

    /// Nominal token lifetime for the background heuristic.
    pub fn estimated_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.estimated_token_lifetime = lifetime;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<RefreshConfig, AuthError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Create a new refresh configuration builder.
pub fn refresh_config() -> RefreshConfigBuilder {
    RefreshConfigBuilder::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_success() {
        let config = OAuth2ConfigBuilder::new()
            .client_id("test-client")
            .client_secret("test-secret")
            .authorization_endpoint("https://example.com/authorize")
            .token_endpoint("https://example.com/token")
            .add_scope("openid")
            .add_scope("profile")
            .build()
            .unwrap();

        assert_eq!(config.credentials.client_id, "test-client");
        assert_eq!(config.provider.token_endpoint, "https://example.com/token");
        assert_eq!(config.scopes, vec!["openid", "profile"]);
        assert_eq!(config.credentials.auth_method, ClientAuthMethod::ClientSecretPost);
    }

    #[test]
    fn test_builder_missing_client_id() {
        let result = OAuth2ConfigBuilder::new()
            .client_secret("test-secret")
            .google()
            .build();

        assert!(matches!(
            result,
            Err(AuthError::Configuration(ConfigurationError::MissingField {
                field: "client_id"
            }))
        ));
    }

    #[test]
    fn test_builder_missing_secret_with_basic_auth() {
        let result = OAuth2ConfigBuilder::new()
            .client_id("test-client")
            .auth_method(ClientAuthMethod::ClientSecretBasic)
            .google()
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_builder_no_secret_required_for_none_auth() {
        let config = OAuth2ConfigBuilder::new()
            .client_id("test-client")
            .auth_method(ClientAuthMethod::None)
            .google()
            .build()
            .unwrap();

        assert!(config.credentials.client_secret.is_none());
        assert_eq!(config.provider.token_endpoint, crate::types::GOOGLE_TOKEN_URL);
    }

    #[test]
    fn test_builder_rejects_invalid_endpoint() {
        let result = OAuth2ConfigBuilder::new()
            .client_id("test-client")
            .auth_method(ClientAuthMethod::None)
            .authorization_endpoint("https://example.com/authorize")
            .token_endpoint("not a url")
            .build();

        assert!(matches!(
            result,
            Err(AuthError::Configuration(
                ConfigurationError::InvalidEndpoint { .. }
            ))
        ));
    }

    #[test]
    fn test_refresh_config_builder() {
        let config = refresh_config()
            .retry_max_attempts(5)
            .retry_delays(Duration::from_millis(200), Duration::from_secs(5))
            .grace_period(Duration::from_secs(60))
            .build()
            .unwrap();

        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.retry_base_delay, Duration::from_millis(200));
        assert_eq!(config.grace_period, Duration::from_secs(60));

        assert!(refresh_config().jitter_percent(1.5).build().is_err());
        assert!(refresh_config()
            .retry_delays(Duration::from_secs(10), Duration::from_secs(1))
            .build()
            .is_err());
    }
}
