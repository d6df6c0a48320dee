//! Token Lifecycle Error Types
//!
//! Error hierarchy for token loading, validation, refresh and persistence.
//!
//! Every error is `Clone` so that a single refresh outcome can be handed to all
//! callers that joined the same in-flight refresh.

use std::time::Duration;
use thiserror::Error;

/// Root error type for token lifecycle operations.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("no token stored - authentication required")]
    NoToken,

    #[error("Token validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Token refresh error: {0}")]
    Refresh(#[from] RefreshError),

    #[error("failed to refresh expired token and grace period exceeded: {source}")]
    RefreshFailed {
        #[source]
        source: Box<AuthError>,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("{operation}: operation cancelled")]
    Cancelled { operation: &'static str },

    #[error("{operation}: deadline exceeded")]
    DeadlineExceeded { operation: &'static str },
}

impl AuthError {
    /// Get error code for telemetry.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoToken => "AUTH_NO_TOKEN",
            Self::Validation(_) => "AUTH_VALIDATION",
            Self::Refresh(_) => "AUTH_REFRESH",
            Self::RefreshFailed { .. } => "AUTH_REFRESH_FAILED",
            Self::Storage(_) => "AUTH_STORAGE",
            Self::Transport(_) => "AUTH_TRANSPORT",
            Self::Configuration(_) => "AUTH_CONFIG",
            Self::Cancelled { .. } | Self::DeadlineExceeded { .. } => "AUTH_CANCELLED",
        }
    }

    /// Check if the error is worth another refresh attempt.
    ///
    /// Structured information (HTTP status, provider error code, transport kind)
    /// decides first. Only opaque exchange failures fall back to matching the
    /// message against [`RETRYABLE_ERROR_MARKERS`].
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Refresh(e) => e.is_retryable(),
            Self::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if the error means the caller went away (cancellation or deadline).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::DeadlineExceeded { .. })
    }

    /// Check if error requires interactive re-authorization.
    pub fn needs_reauth(&self) -> bool {
        match self {
            Self::NoToken => true,
            Self::RefreshFailed { .. } => true,
            Self::Refresh(RefreshError::NoRefreshToken) => true,
            Self::Refresh(RefreshError::Terminal { .. }) => true,
            _ => false,
        }
    }
}

/// Structural token validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is empty")]
    Empty { field: &'static str },

    #[error("{field} too short ({len} < {min})")]
    TooShort {
        field: &'static str,
        len: usize,
        min: usize,
    },

    #[error("{field} too long ({len} > {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field} contains invalid characters")]
    InvalidCharacters { field: &'static str },
}

/// Refresh exchange error.
#[derive(Error, Debug, Clone)]
pub enum RefreshError {
    /// Network, 5xx or 429-class failure reported with structured status.
    #[error("transient refresh failure: {message}")]
    Transient {
        message: String,
        status: Option<u16>,
    },

    /// Provider rejected the refresh (invalid_grant and friends).
    #[error("refresh rejected: {message}")]
    Terminal {
        message: String,
        status: Option<u16>,
    },

    /// Unclassified failure; retryability is decided from the message.
    #[error("refresh exchange failed: {message}")]
    Exchange { message: String },

    #[error("token refresh timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("timed out after {waited:?} waiting for in-flight refresh to complete")]
    JoinTimeout { waited: Duration },

    #[error("token expired and no refresh token available - re-authentication required")]
    NoRefreshToken,

    #[error("token refresh failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_error: Box<AuthError>,
    },
}

impl RefreshError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => true,
            Self::Exchange { message } => is_retryable_message(message),
            _ => false,
        }
    }
}

/// Storage error.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("no token stored at {path}")]
    NotFound { path: String },

    #[error("corrupted token data at {path}: {message}")]
    Corrupted { path: String, message: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Read failed: {message}")]
    ReadFailed { message: String },

    #[error("Write failed: {message}")]
    WriteFailed { message: String },

    #[error("Delete failed: {message}")]
    DeleteFailed { message: String },
}

impl StorageError {
    /// Map an I/O error for `path` onto the storage taxonomy.
    pub fn from_io(path: &str, error: &std::io::Error, op: StorageOp) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound if op == StorageOp::Read => Self::NotFound {
                path: path.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_string(),
            },
            _ => {
                let message = format!("{}: {}", path, error);
                match op {
                    StorageOp::Read => Self::ReadFailed { message },
                    StorageOp::Write => Self::WriteFailed { message },
                    StorageOp::Delete => Self::DeleteFailed { message },
                }
            }
        }
    }
}

/// Kind of storage operation, used when mapping I/O errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Read,
    Write,
    Delete,
}

/// HTTP transport error.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Unexpected redirect to: {location}")]
    UnexpectedRedirect { location: String },

    #[error("Response too large: {size} bytes")]
    ResponseTooLarge { size: usize },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Client build failed: {message}")]
    ClientBuild { message: String },
}

impl TransportError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. } | Self::Timeout { .. })
    }
}

/// Configuration error.
#[derive(Error, Debug, Clone)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {field}: {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("Invalid endpoint URL: {url}")]
    InvalidEndpoint { url: String },
}

/// Result type for token lifecycle operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Lower-case fragments that mark an opaque error message as transient.
pub const RETRYABLE_ERROR_MARKERS: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "temporary",
    "unavailable",
    "rate limit",
    "429",
    "500",
    "502",
    "503",
    "504",
];

/// Check an error message against the transient-failure vocabulary.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_ERROR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Check if an HTTP status marks a transient provider failure.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// OAuth2 error response from provider (RFC 6749 section 5.2).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuth2ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_uri: Option<String>,
}

/// Parse error response from HTTP body.
pub fn parse_error_response(body: &str) -> Option<OAuth2ErrorResponse> {
    serde_json::from_str(body).ok()
}

/// Create a refresh error from a non-success token endpoint response.
///
/// The provider error code decides when the body carries one; otherwise the
/// HTTP status does.
pub fn create_error_from_response(status: u16, body: &str) -> AuthError {
    if let Some(response) = parse_error_response(body) {
        let message = match &response.error_description {
            Some(description) => format!("{}: {}", response.error, description),
            None => response.error.clone(),
        };
        let transient = matches!(
            response.error.as_str(),
            "temporarily_unavailable" | "server_error"
        ) || is_retryable_status(status);

        let error = if transient {
            RefreshError::Transient {
                message,
                status: Some(status),
            }
        } else {
            RefreshError::Terminal {
                message,
                status: Some(status),
            }
        };
        return AuthError::Refresh(error);
    }

    let message = format!("HTTP {}", status);
    let error = if is_retryable_status(status) {
        RefreshError::Transient {
            message,
            status: Some(status),
        }
    } else {
        RefreshError::Terminal {
            message,
            status: Some(status),
        }
    };

    AuthError::Refresh(error)
}

/// Get user-friendly error message.
pub fn get_user_message(error: &AuthError) -> String {
    match error {
        AuthError::NoToken => "You are not signed in. Please sign in first.".to_string(),
        AuthError::RefreshFailed { .. }
        | AuthError::Refresh(RefreshError::NoRefreshToken)
        | AuthError::Refresh(RefreshError::Terminal { .. }) => {
            "Your session has expired and cannot be renewed. Please sign in again.".to_string()
        }
        AuthError::Refresh(RefreshError::JoinTimeout { .. })
        | AuthError::Refresh(RefreshError::Timeout { .. }) => {
            "Renewing your session is taking too long. Please try again.".to_string()
        }
        AuthError::Refresh(_) | AuthError::Transport(_) => {
            "The authentication service is temporarily unavailable. Please try again later."
                .to_string()
        }
        AuthError::Storage(_) => {
            "Stored credentials could not be read or written. Check the credential store."
                .to_string()
        }
        AuthError::Configuration(_) => {
            "Authentication is misconfigured. Check the client settings.".to_string()
        }
        _ => "An authentication error occurred. Please try again.".to_string(),
    }
}
