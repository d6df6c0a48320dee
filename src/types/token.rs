//! Token Types
//!
//! Bearer credential representation and the token endpoint response.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ValidationError;

/// Minimum accepted length of an access or refresh value.
pub const MIN_TOKEN_LENGTH: usize = 10;

/// Maximum accepted length of an access or refresh value.
pub const MAX_TOKEN_LENGTH: usize = 4096;

/// Characters that must never appear in a token value.
pub const FORBIDDEN_TOKEN_CHARS: &[char] = &['\0', '\r', '\n'];

/// Bearer credential with optional refresh value and expiry.
///
/// Serialized in the same shape as a Go `oauth2.Token`, so credential files
/// written by other tools load unchanged. `expiry` absent means the token never
/// expires.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Access value (opaque).
    pub access_token: String,
    /// Token type, usually "Bearer".
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Refresh value (opaque).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiration instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Token {
    /// Create a bearer token without refresh value or expiry.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            refresh_token: None,
            expiry: None,
        }
    }

    /// Set the refresh value.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Set the expiry instant.
    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Set the token type.
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    /// Check if token is past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map(|exp| exp <= now).unwrap_or(false)
    }

    /// Check if token expires within `threshold` of `now`.
    ///
    /// Tokens without expiry never need a refresh.
    pub fn needs_refresh(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        let threshold = Duration::from_std(threshold).unwrap_or(Duration::MAX);
        self.expiry
            .map(|exp| exp < now.checked_add_signed(threshold).unwrap_or(DateTime::<Utc>::MAX_UTC))
            .unwrap_or(false)
    }

    /// Signed time until expiry; negative once expired.
    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expiry.map(|exp| exp - now)
    }

    /// Check if has refresh token.
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }

    /// Format as Authorization header value.
    pub fn authorization_header(&self) -> String {
        let token_type = if self.token_type.is_empty() {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        format!("{} {}", token_type, self.access_token)
    }

    /// Validate the structure of both values.
    ///
    /// The access value must be present; the refresh value is checked only when
    /// present. Control characters are rejected because they corrupt stored
    /// files, log lines and HTTP headers.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_value("access token", &self.access_token)?;
        if let Some(refresh) = self.refresh_token.as_deref() {
            if !refresh.is_empty() {
                validate_value("refresh token", refresh)?;
            }
        }
        Ok(())
    }
}

fn validate_value(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.len() < MIN_TOKEN_LENGTH {
        return Err(ValidationError::TooShort {
            field,
            len: value.len(),
            min: MIN_TOKEN_LENGTH,
        });
    }
    if value.len() > MAX_TOKEN_LENGTH {
        return Err(ValidationError::TooLong {
            field,
            len: value.len(),
            max: MAX_TOKEN_LENGTH,
        });
    }
    if value.contains(FORBIDDEN_TOKEN_CHARS) {
        return Err(ValidationError::InvalidCharacters { field });
    }
    Ok(())
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Token response from authorization server.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type (usually "Bearer").
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Expires in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
    /// Additional fields.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl TokenResponse {
    /// Convert into a [`Token`] issued at `now`.
    ///
    /// Providers may omit the refresh token on a refresh grant; the previous
    /// refresh value is carried over in that case.
    pub fn into_token(self, previous_refresh: Option<&str>, now: DateTime<Utc>) -> Token {
        let expiry = self
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| now + Duration::seconds(secs));

        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string));

        Token {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token,
            expiry,
        }
    }
}
