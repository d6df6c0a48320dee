//! Token Management
//!
//! Token lifecycle management: storage, caching, coordinated refresh and
//! background renewal.
//!
//! This module provides:
//!
//! - **Credential Storage**: in-memory, file-backed and mock stores
//! - **Refresh Transport**: the refresh-token grant against a token endpoint
//! - **Token Cache**: short-lived snapshot of the last validated token
//! - **Refresh Coordinator**: single-flight refresh shared by all callers
//! - **Background Refresher**: proactive renewal before expiry
//! - **Token Lifecycle Manager**: the façade tying it together

pub mod background;
pub mod cache;
pub mod coordinator;
pub mod manager;
pub mod refresh;
pub mod storage;

// Credential Storage
pub use storage::{
    CredentialStore, FileSystemCredentialStore, InMemoryCredentialStore, MockCredentialStore,
    DEFAULT_STORAGE_DIR, TOKEN_FILE_NAME,
};

// Refresh Transport
pub use refresh::{MockRefreshTransport, OAuth2RefreshTransport, RefreshTransport};

// Cache and coordination
pub use cache::{CachedToken, TokenCache};
pub use coordinator::{RefreshCoordinator, RefreshState};

// Background refresh
pub use background::{should_background_refresh, BackgroundRefresher};

// Token Lifecycle Manager
pub use manager::{TokenLifecycleManager, TokenLifecycleManagerBuilder};
