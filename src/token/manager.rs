//! Token Lifecycle Manager
//!
//! Façade that hands out valid tokens: cache first, then the store, then a
//! coordinated refresh with retry and a bounded grace period.

use chrono::Utc;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::core::{
    BearerTransport, CallContext, HttpTransport, ReqwestHttpTransport, DEFAULT_MAX_RESPONSE_SIZE,
};
use crate::error::{AuthError, AuthResult, ConfigurationError, RefreshError, StorageError};
use crate::resilience::RetryPolicy;
use crate::token::background::{should_background_refresh, BackgroundRefresher};
use crate::token::cache::TokenCache;
use crate::token::coordinator::{RefreshCoordinator, RefreshState};
use crate::token::refresh::{OAuth2RefreshTransport, RefreshTransport};
use crate::token::storage::CredentialStore;
use crate::types::{AuthStatus, OAuth2Config, RefreshConfig, Token, DEFAULT_TIMEOUT};

/// Shared state behind the façade; the background task holds it weakly.
pub(crate) struct ManagerInner {
    store: Arc<dyn CredentialStore>,
    refresh_transport: Arc<dyn RefreshTransport>,
    http_transport: Arc<dyn HttpTransport>,
    config: RwLock<RefreshConfig>,
    cache: TokenCache,
    coordinator: RefreshCoordinator,
    // Serializes store writes against clear_credentials.
    store_gate: AsyncMutex<()>,
}

impl ManagerInner {
    pub(crate) fn refresh_config(&self) -> RefreshConfig {
        self.config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    async fn get_valid_token(&self, ctx: &CallContext) -> AuthResult<Token> {
        ctx.check("get_valid_token")?;
        let config = self.refresh_config();

        if let Some(token) = self
            .cache
            .get(Utc::now(), config.cache_validity, config.token_refresh_threshold)
            .await
        {
            debug!("token cache hit");
            return Ok(token);
        }

        let epoch = self.cache.epoch();
        let observed = self.coordinator.generation();
        let token = self.load_stored(ctx).await?.ok_or(AuthError::NoToken)?;
        token.validate()?;

        if !token.needs_refresh(Utc::now(), config.token_refresh_threshold) {
            self.cache.put(token.clone(), epoch).await;
            return Ok(token);
        }

        if !token.has_refresh_token() {
            return Err(RefreshError::NoRefreshToken.into());
        }

        debug!(expiry = ?token.expiry, "token needs refresh");
        let result = self
            .coordinator
            .refresh_or_join(ctx, observed, config.refresh_lock_timeout, || {
                self.refresh_with_retry(ctx, &token, epoch, &config)
            })
            .await;

        match result {
            Ok(refreshed) => {
                self.cache.put(refreshed.clone(), epoch).await;
                Ok(refreshed)
            }
            Err(error) if error.is_cancellation() => Err(error),
            Err(error) => self.grace_fallback(token, error, epoch, &config).await,
        }
    }

    /// Serve `token` after a failed refresh if it expired less than the grace
    /// period ago.
    async fn grace_fallback(
        &self,
        token: Token,
        error: AuthError,
        epoch: u64,
        config: &RefreshConfig,
    ) -> AuthResult<Token> {
        if self.cache.epoch() != epoch {
            return Err(error);
        }

        let grace = chrono::Duration::from_std(config.grace_period).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let stale_until = token
            .expiry
            .filter(|expiry| now - *expiry <= grace)
            .and_then(|expiry| expiry.checked_add_signed(grace));

        match stale_until {
            Some(stale_until) => {
                warn!(
                    error = %error,
                    expiry = ?token.expiry,
                    "using expired token during grace period after refresh failure"
                );
                self.cache.put_stale(token.clone(), stale_until, epoch).await;
                Ok(token)
            }
            None => Err(AuthError::RefreshFailed {
                source: Box::new(error),
            }),
        }
    }

    /// Retry the exchange, validate the result and persist it.
    async fn refresh_with_retry(
        &self,
        ctx: &CallContext,
        current: &Token,
        epoch: u64,
        config: &RefreshConfig,
    ) -> AuthResult<Token> {
        let refresh_value = current
            .refresh_token
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or(RefreshError::NoRefreshToken)?;
        let timeout = config.token_refresh_timeout;

        let mut refreshed = RetryPolicy::from_config(config)
            .execute(
                ctx,
                move |attempt| async move {
                    debug!(attempt, "refreshing token");
                    self.exchange(ctx, refresh_value, timeout).await
                },
                |attempt, error| {
                    warn!(attempt, error = %error, "token refresh attempt failed");
                    self.coordinator.record_failure(error);
                },
            )
            .await?;

        if !refreshed.has_refresh_token() {
            refreshed.refresh_token = Some(refresh_value.to_string());
        }
        refreshed.validate()?;

        self.persist(&refreshed, epoch).await?;
        info!(expiry = ?refreshed.expiry, "token refreshed");
        Ok(refreshed)
    }

    async fn exchange(
        &self,
        ctx: &CallContext,
        refresh_value: &str,
        timeout: std::time::Duration,
    ) -> AuthResult<Token> {
        ctx.run("refresh_token", async {
            tokio::time::timeout(timeout, self.refresh_transport.refresh(refresh_value, timeout))
                .await
                .unwrap_or(Err(RefreshError::Timeout { timeout }.into()))
        })
        .await
    }

    /// Write `token` to the store unless the credentials were cleared since
    /// `epoch` was observed.
    async fn persist(&self, token: &Token, epoch: u64) -> AuthResult<()> {
        let _gate = self.store_gate.lock().await;
        if self.cache.epoch() != epoch {
            info!("credentials cleared during refresh, discarding refreshed token");
            return Err(AuthError::NoToken);
        }
        self.store.store_token(token).await?;
        Ok(())
    }

    /// Load the stored token; a missing record is `None`.
    async fn load_stored(&self, ctx: &CallContext) -> AuthResult<Option<Token>> {
        ctx.run("load_token", async {
            match self.store.load_token().await {
                Ok(token) => Ok(Some(token)),
                Err(StorageError::NotFound { .. }) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// One background check; failures are logged and recorded, never returned.
    pub(crate) async fn background_tick(&self, ctx: &CallContext) {
        let config = self.refresh_config();
        let epoch = self.cache.epoch();
        let observed = self.coordinator.generation();

        let token = match self.load_stored(ctx).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("background check: no stored token");
                return;
            }
            Err(e) => {
                debug!(error = %e, "background check: could not load token");
                return;
            }
        };

        if !should_background_refresh(
            &token,
            Utc::now(),
            config.estimated_token_lifetime,
            config.background_refresh_threshold,
        ) {
            return;
        }

        info!("starting background token refresh");
        let outcome = self
            .coordinator
            .refresh_if_idle(observed, || {
                self.refresh_with_retry(ctx, &token, epoch, &config)
            })
            .await;

        match outcome {
            None => debug!("refresh already in flight, background refresh skipped"),
            Some(Ok(refreshed)) => {
                self.cache.put(refreshed, epoch).await;
                info!("background token refresh completed");
            }
            Some(Err(e)) => warn!(error = %e, "background token refresh failed"),
        }
    }
}

/// Token lifecycle manager.
///
/// Owns the background refresher; dropping the manager stops it, and
/// [`TokenLifecycleManager::shutdown`] also waits for it to exit. Construct it
/// with [`TokenLifecycleManager::builder`] inside a Tokio runtime.
pub struct TokenLifecycleManager {
    inner: Arc<ManagerInner>,
    background: BackgroundRefresher,
}

impl TokenLifecycleManager {
    /// Start building a manager.
    pub fn builder() -> TokenLifecycleManagerBuilder {
        TokenLifecycleManagerBuilder::default()
    }

    /// Return a token that is valid for at least the refresh threshold.
    ///
    /// Fails with [`AuthError::NoToken`] when nothing is stored,
    /// [`AuthError::RefreshFailed`] when refresh and grace period are both
    /// exhausted, or the context's cancellation error.
    #[instrument(skip_all)]
    pub async fn get_valid_token(&self, ctx: &CallContext) -> AuthResult<Token> {
        self.inner.get_valid_token(ctx).await
    }

    /// HTTP transport that authorizes every request with a valid token.
    #[instrument(skip_all)]
    pub async fn authenticated_transport(&self, ctx: &CallContext) -> AuthResult<BearerTransport> {
        let token = self.inner.get_valid_token(ctx).await?;
        Ok(BearerTransport::new(self.inner.http_transport.clone(), token))
    }

    /// Clear stored credentials, cache and refresh state together.
    ///
    /// A `get_valid_token` call that starts after this returns never sees the
    /// cleared token, and a refresh that was in flight does not write it back.
    #[instrument(skip_all)]
    pub async fn clear_credentials(&self) -> AuthResult<()> {
        let _cache = self.inner.cache.invalidate().await;
        let _gate = self.inner.store_gate.lock().await;
        self.inner.store.clear_token().await?;
        self.inner.coordinator.reset();
        info!("credentials cleared");
        Ok(())
    }

    /// Persist the first token obtained by an interactive authorization flow.
    #[instrument(skip_all)]
    pub async fn store_authorized_token(&self, token: Token) -> AuthResult<()> {
        token.validate()?;
        let epoch = self.inner.cache.epoch();
        {
            let _gate = self.inner.store_gate.lock().await;
            self.inner.store.store_token(&token).await?;
        }
        self.inner.coordinator.reset();
        self.inner.cache.put(token, epoch).await;
        info!("authorized token stored");
        Ok(())
    }

    /// Refresh now, regardless of expiry, joining any refresh in flight.
    #[instrument(skip_all)]
    pub async fn refresh_now(&self, ctx: &CallContext) -> AuthResult<Token> {
        ctx.check("refresh_now")?;
        let config = self.inner.refresh_config();
        let epoch = self.inner.cache.epoch();
        let observed = self.inner.coordinator.generation();
        let token = self
            .inner
            .load_stored(ctx)
            .await?
            .ok_or(AuthError::NoToken)?;

        let refreshed = self
            .inner
            .coordinator
            .refresh_or_join(ctx, observed, config.refresh_lock_timeout, || {
                self.inner.refresh_with_retry(ctx, &token, epoch, &config)
            })
            .await?;
        self.inner.cache.put(refreshed.clone(), epoch).await;
        Ok(refreshed)
    }

    /// Check if a stored, unexpired token exists.
    pub async fn is_authenticated(&self) -> bool {
        let status = self.get_auth_status().await;
        status.authenticated && !status.is_expired
    }

    /// Serializable snapshot of the stored credential.
    pub async fn get_auth_status(&self) -> AuthStatus {
        let storage_path = self.inner.store.storage_path();
        match self.inner.store.load_token().await {
            Ok(token) => {
                let mut status = AuthStatus::from_token(&token, storage_path, Utc::now());
                status.error = self
                    .inner
                    .coordinator
                    .state()
                    .last_error
                    .map(|e| e.to_string());
                status
            }
            Err(StorageError::NotFound { .. }) => {
                AuthStatus::unauthenticated(storage_path, "no token stored")
            }
            Err(e) => AuthStatus::unauthenticated(storage_path, e.to_string()),
        }
    }

    /// Snapshot of the refresh state machine.
    pub fn get_refresh_state(&self) -> RefreshState {
        self.inner.coordinator.state()
    }

    /// Current refresh configuration.
    pub fn get_refresh_config(&self) -> RefreshConfig {
        self.inner.refresh_config()
    }

    /// Replace the refresh configuration; invalid configurations are rejected.
    pub fn set_refresh_config(&self, config: RefreshConfig) -> AuthResult<()> {
        config.validate()?;
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config;
        debug!("refresh configuration replaced");
        Ok(())
    }

    /// Check if the background refresher is running.
    pub fn is_background_running(&self) -> bool {
        self.background.is_running()
    }

    /// Stop the background refresher and wait for it to exit.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        self.background.shutdown().await;
        info!("token lifecycle manager shut down");
    }
}

impl Drop for TokenLifecycleManager {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycleManager")
            .field("storage_path", &self.inner.store.storage_path())
            .field("refresh_state", &self.inner.coordinator.state())
            .finish_non_exhaustive()
    }
}

/// Builder for [`TokenLifecycleManager`].
#[derive(Default)]
pub struct TokenLifecycleManagerBuilder {
    store: Option<Arc<dyn CredentialStore>>,
    refresh_transport: Option<Arc<dyn RefreshTransport>>,
    http_transport: Option<Arc<dyn HttpTransport>>,
    oauth2_config: Option<OAuth2Config>,
    refresh_config: Option<RefreshConfig>,
}

impl TokenLifecycleManagerBuilder {
    /// Set the credential store (required).
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the refresh transport; defaults to the token endpoint of the OAuth2 config.
    pub fn refresh_transport(mut self, transport: Arc<dyn RefreshTransport>) -> Self {
        self.refresh_transport = Some(transport);
        self
    }

    /// Set the HTTP transport used for the token endpoint and authenticated calls.
    pub fn http_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.http_transport = Some(transport);
        self
    }

    /// Set the OAuth2 client configuration.
    pub fn oauth2_config(mut self, config: OAuth2Config) -> Self {
        self.oauth2_config = Some(config);
        self
    }

    /// Set the refresh configuration.
    pub fn refresh_config(mut self, config: RefreshConfig) -> Self {
        self.refresh_config = Some(config);
        self
    }

    /// Build the manager and start its background refresher.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> AuthResult<TokenLifecycleManager> {
        let store = self.store.ok_or(ConfigurationError::MissingField {
            field: "credential_store",
        })?;

        let refresh_config = self.refresh_config.unwrap_or_default();
        refresh_config.validate()?;

        let http_transport: Arc<dyn HttpTransport> = match self.http_transport {
            Some(transport) => transport,
            None => {
                let timeout = self
                    .oauth2_config
                    .as_ref()
                    .map(|c| c.timeout)
                    .unwrap_or(DEFAULT_TIMEOUT);
                Arc::new(ReqwestHttpTransport::with_options(
                    timeout,
                    DEFAULT_MAX_RESPONSE_SIZE,
                )?)
            }
        };

        let refresh_transport: Arc<dyn RefreshTransport> =
            match (self.refresh_transport, self.oauth2_config) {
                (Some(transport), _) => transport,
                (None, Some(config)) => {
                    Arc::new(OAuth2RefreshTransport::new(config, http_transport.clone()))
                }
                (None, None) => {
                    return Err(ConfigurationError::MissingField {
                        field: "oauth2_config",
                    }
                    .into())
                }
            };

        let inner = Arc::new(ManagerInner {
            store,
            refresh_transport,
            http_transport,
            config: RwLock::new(refresh_config),
            cache: TokenCache::new(),
            coordinator: RefreshCoordinator::new(),
            store_gate: AsyncMutex::new(()),
        });
        let background = BackgroundRefresher::spawn(Arc::downgrade(&inner))?;

        info!(storage_path = %inner.store.storage_path(), "token lifecycle manager started");
        Ok(TokenLifecycleManager { inner, background })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::refresh::MockRefreshTransport;
    use crate::token::storage::MockCredentialStore;
    use chrono::Duration as ChronoDuration;

    fn expiring_token(access: &str, minutes: i64) -> Token {
        Token::new(access)
            .with_refresh_token("refresh-token-value")
            .with_expiry(Utc::now() + ChronoDuration::minutes(minutes))
    }

    fn manager(
        store: Arc<MockCredentialStore>,
        transport: Arc<MockRefreshTransport>,
    ) -> TokenLifecycleManager {
        TokenLifecycleManager::builder()
            .credential_store(store)
            .refresh_transport(transport)
            .http_transport(Arc::new(crate::core::MockHttpTransport::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_token_stored() {
        let manager = manager(
            Arc::new(MockCredentialStore::new()),
            Arc::new(MockRefreshTransport::new()),
        );
        let result = manager.get_valid_token(&CallContext::new()).await;
        assert!(matches!(result, Err(AuthError::NoToken)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_fresh_token_is_cached() {
        let store = Arc::new(MockCredentialStore::new());
        store.set_token(expiring_token("stored-access-token", 60));
        let manager = manager(store.clone(), Arc::new(MockRefreshTransport::new()));

        let first = manager.get_valid_token(&CallContext::new()).await.unwrap();
        let second = manager.get_valid_token(&CallContext::new()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.load_count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_storage_error_surfaces() {
        let store = Arc::new(MockCredentialStore::new());
        store.set_next_load_error(StorageError::PermissionDenied {
            path: "mock".to_string(),
        });
        let manager = manager(store, Arc::new(MockRefreshTransport::new()));

        let result = manager.get_valid_token(&CallContext::new()).await;
        assert!(matches!(
            result,
            Err(AuthError::Storage(StorageError::PermissionDenied { .. }))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_without_refresh_value() {
        let store = Arc::new(MockCredentialStore::new());
        store.set_token(
            Token::new("stored-access-token").with_expiry(Utc::now() - ChronoDuration::minutes(1)),
        );
        let manager = manager(store, Arc::new(MockRefreshTransport::new()));

        let result = manager.get_valid_token(&CallContext::new()).await;
        assert!(matches!(
            result,
            Err(AuthError::Refresh(RefreshError::NoRefreshToken))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_refreshed_token_is_a_failure() {
        let store = Arc::new(MockCredentialStore::new());
        store.set_token(
            Token::new("stored-access-token")
                .with_refresh_token("refresh-token-value")
                .with_expiry(Utc::now() - ChronoDuration::hours(1)),
        );
        let transport = Arc::new(MockRefreshTransport::new());
        transport.queue_token(Token::new("bad"));
        let manager = manager(store.clone(), transport);

        let result = manager.get_valid_token(&CallContext::new()).await;
        match result {
            Err(AuthError::RefreshFailed { source }) => {
                assert!(matches!(*source, AuthError::Validation(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(store.get_store_history().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_refresh_config_validates() {
        let manager = manager(
            Arc::new(MockCredentialStore::new()),
            Arc::new(MockRefreshTransport::new()),
        );
        let invalid = RefreshConfig {
            jitter_percent: 2.0,
            ..Default::default()
        };
        assert!(manager.set_refresh_config(invalid).is_err());

        let updated = RefreshConfig {
            retry_max_attempts: 5,
            ..Default::default()
        };
        manager.set_refresh_config(updated.clone()).unwrap();
        assert_eq!(manager.get_refresh_config(), updated);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_builder_requires_store() {
        let result = TokenLifecycleManager::builder()
            .refresh_transport(Arc::new(MockRefreshTransport::new()))
            .build();
        assert!(matches!(
            result,
            Err(AuthError::Configuration(ConfigurationError::MissingField {
                field: "credential_store"
            }))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_background() {
        let manager = manager(
            Arc::new(MockCredentialStore::new()),
            Arc::new(MockRefreshTransport::new()),
        );
        assert!(manager.is_background_running());
        manager.shutdown().await;
        assert!(!manager.is_background_running());
        manager.shutdown().await;
    }
}
