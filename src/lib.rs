//! OAuth2 Token Lifecycle
//!
//! Keeps an OAuth2 access token valid for concurrent callers without handing
//! out expired tokens and without redundant refresh calls.
//!
//! # Features
//!
//! - In-memory token cache with a short validity window
//! - Single-flight refresh: concurrent callers share one exchange
//! - Exponential backoff with jitter for transient refresh failures
//! - Grace period serving a just-expired token when refresh fails
//! - Background renewal before expiry, with clean shutdown
//! - Token Refresh (RFC 6749 Section 6) over a pluggable HTTP transport
//! - File-backed credential store compatible with `oauth_creds.json`
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use oauth2_token_lifecycle::{
//!     oauth2_config, CallContext, FileSystemCredentialStore, TokenLifecycleManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = oauth2_config()
//!         .client_id("my-client-id")
//!         .client_secret("my-client-secret")
//!         .google()
//!         .build()?;
//!
//!     let store = Arc::new(FileSystemCredentialStore::default_location().await?);
//!
//!     let manager = TokenLifecycleManager::builder()
//!         .credential_store(store)
//!         .oauth2_config(config)
//!         .build()?;
//!
//!     let token = manager.get_valid_token(&CallContext::new()).await?;
//!     println!("expires at {:?}", token.expiry);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `types`: token, configuration and status types
//! - `error`: error hierarchy and provider error mapping
//! - `core`: HTTP transport seam and per-call cancellation context
//! - `resilience`: retry policy with exponential backoff
//! - `token`: storage, cache, refresh coordination, background refresh, manager
//! - `builders`: fluent builders for configuration

pub mod builders;
pub mod core;
pub mod error;
pub mod resilience;
pub mod token;
pub mod types;

// Re-export builders
pub use builders::{oauth2_config, refresh_config, OAuth2ConfigBuilder, RefreshConfigBuilder};

// Re-export errors
pub use error::{
    create_error_from_response, get_user_message, is_retryable_message, parse_error_response,
    AuthError, AuthResult, ConfigurationError, OAuth2ErrorResponse, RefreshError, StorageError,
    TransportError, ValidationError,
};

// Re-export types
pub use types::{
    AuthStatus, ClientAuthMethod, ClientCredentials, OAuth2Config, ProviderConfig, RefreshConfig,
    Token, TokenResponse,
};

// Re-export core components
pub use core::{
    BearerTransport, CallContext, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
    MockHttpTransport, ReqwestHttpTransport,
};

// Re-export resilience
pub use resilience::RetryPolicy;

// Re-export token management
pub use token::{
    CredentialStore, FileSystemCredentialStore, InMemoryCredentialStore, MockCredentialStore,
    MockRefreshTransport, OAuth2RefreshTransport, RefreshCoordinator, RefreshState,
    RefreshTransport, TokenCache, TokenLifecycleManager, TokenLifecycleManagerBuilder,
};
