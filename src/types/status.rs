//! Authentication status report.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Token;

/// Serializable snapshot of the stored credential.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Seconds until expiry; negative once expired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<i64>,
    pub is_expired: bool,
    pub has_refresh_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    /// Last refresh error, or the reason no token could be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthStatus {
    /// Status for a readable stored token.
    pub fn from_token(token: &Token, storage_path: String, now: DateTime<Utc>) -> Self {
        Self {
            authenticated: true,
            token_type: Some(token.token_type.clone()),
            expires_at: token.expiry,
            expires_in_secs: token.time_to_expiry(now).map(|d| d.num_seconds()),
            is_expired: token.is_expired(now),
            has_refresh_token: token.has_refresh_token(),
            storage_path: Some(storage_path),
            error: None,
        }
    }

    /// Status when no usable token could be read.
    pub fn unauthenticated(storage_path: String, error: impl Into<String>) -> Self {
        Self {
            storage_path: Some(storage_path),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
