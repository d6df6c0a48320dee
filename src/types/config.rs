//! Configuration Types
//!
//! OAuth2 client configuration and the refresh tuning snapshot.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigurationError;

/// Google OAuth2 authorization endpoint.
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";

/// Google OAuth2 token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scopes requested for Code Assist style access.
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

/// Default HTTP timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Safety margin before expiry at which a token already counts as stale.
pub const DEFAULT_TOKEN_REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Bound on a single refresh exchange.
pub const DEFAULT_TOKEN_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a validated token is served from memory before the store is re-read.
pub const DEFAULT_CACHE_VALIDITY: Duration = Duration::from_secs(60);

/// Assumed total lifetime of a token; providers do not report issue time.
pub const DEFAULT_ESTIMATED_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// OAuth2 client configuration.
#[derive(Clone, Debug)]
pub struct OAuth2Config {
    /// Provider configuration.
    pub provider: ProviderConfig,
    /// Client credentials.
    pub credentials: ClientCredentials,
    /// Scopes to request.
    pub scopes: Vec<String>,
    /// HTTP timeout.
    pub timeout: Duration,
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            credentials: ClientCredentials::default(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// OAuth2 provider endpoint configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Authorization endpoint URL.
    pub authorization_endpoint: String,
    /// Token endpoint URL.
    pub token_endpoint: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            authorization_endpoint: GOOGLE_AUTH_URL.to_string(),
            token_endpoint: GOOGLE_TOKEN_URL.to_string(),
        }
    }
}

/// Client credentials for OAuth2 authentication.
#[derive(Clone)]
pub struct ClientCredentials {
    /// Client identifier.
    pub client_id: String,
    /// Client secret (for confidential clients).
    pub client_secret: Option<SecretString>,
    /// Client authentication method.
    pub auth_method: ClientAuthMethod,
}

impl Default for ClientCredentials {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            auth_method: ClientAuthMethod::ClientSecretPost,
        }
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("auth_method", &self.auth_method)
            .finish()
    }
}

/// Client authentication method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// client_id and client_secret in request body.
    #[default]
    ClientSecretPost,
    /// HTTP Basic Authentication header.
    ClientSecretBasic,
    /// No client authentication (public client).
    None,
}

/// Refresh tuning snapshot.
///
/// Immutable once handed to the manager; replace it wholesale with
/// `TokenLifecycleManager::set_refresh_config`.
#[derive(Clone, Debug, PartialEq)]
pub struct RefreshConfig {
    /// Fraction (0-1) of the estimated lifetime after which the background
    /// refresher renews the token.
    pub background_refresh_threshold: f64,
    /// Maximum refresh attempts per refresh operation.
    pub retry_max_attempts: u32,
    /// Delay before the first retry; also the floor of every jittered delay.
    pub retry_base_delay: Duration,
    /// Cap on the pre-jitter delay.
    pub retry_max_delay: Duration,
    /// Exponential backoff multiplier.
    pub retry_multiplier: f64,
    /// Jitter fraction (0-1) applied symmetrically around the delay.
    pub jitter_percent: f64,
    /// How long past expiry an old token may still be served after refresh failure.
    pub grace_period: Duration,
    /// Background check period.
    pub background_refresh_interval: Duration,
    /// How long a caller waits for somebody else's in-flight refresh.
    pub refresh_lock_timeout: Duration,
    /// Expiry safety margin for foreground calls.
    pub token_refresh_threshold: Duration,
    /// Bound on one refresh exchange.
    pub token_refresh_timeout: Duration,
    /// In-memory cache validity window.
    pub cache_validity: Duration,
    /// Per-tick bound for background work.
    pub background_tick_timeout: Duration,
    /// Nominal token lifetime used to estimate issue time.
    pub estimated_token_lifetime: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            background_refresh_threshold: 0.5,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
            jitter_percent: 0.1,
            grace_period: Duration::from_secs(5 * 60),
            background_refresh_interval: Duration::from_secs(60),
            refresh_lock_timeout: Duration::from_secs(30),
            token_refresh_threshold: DEFAULT_TOKEN_REFRESH_THRESHOLD,
            token_refresh_timeout: DEFAULT_TOKEN_REFRESH_TIMEOUT,
            cache_validity: DEFAULT_CACHE_VALIDITY,
            background_tick_timeout: Duration::from_secs(30),
            estimated_token_lifetime: DEFAULT_ESTIMATED_TOKEN_LIFETIME,
        }
    }
}

impl RefreshConfig {
    /// Check every field is positive and fractions lie in [0, 1].
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        fraction("background_refresh_threshold", self.background_refresh_threshold)?;
        fraction("jitter_percent", self.jitter_percent)?;

        if self.retry_max_attempts == 0 {
            return Err(invalid("retry_max_attempts", "must be at least 1"));
        }
        if !(self.retry_multiplier.is_finite() && self.retry_multiplier >= 1.0) {
            return Err(invalid("retry_multiplier", "must be a finite value >= 1.0"));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(invalid(
                "retry_max_delay",
                "must not be smaller than retry_base_delay",
            ));
        }

        for (field, value) in [
            ("retry_base_delay", self.retry_base_delay),
            ("retry_max_delay", self.retry_max_delay),
            ("grace_period", self.grace_period),
            ("background_refresh_interval", self.background_refresh_interval),
            ("refresh_lock_timeout", self.refresh_lock_timeout),
            ("token_refresh_threshold", self.token_refresh_threshold),
            ("token_refresh_timeout", self.token_refresh_timeout),
            ("cache_validity", self.cache_validity),
            ("background_tick_timeout", self.background_tick_timeout),
            ("estimated_token_lifetime", self.estimated_token_lifetime),
        ] {
            if value.is_zero() {
                return Err(invalid(field, "must be positive"));
            }
        }

        Ok(())
    }
}

fn fraction(field: &'static str, value: f64) -> Result<(), ConfigurationError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, &format!("{} is outside [0, 1]", value)));
    }
    Ok(())
}

fn invalid(field: &'static str, message: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field,
        message: message.to_string(),
    }
}
