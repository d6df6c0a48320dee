//! Token Cache
//!
//! Short-lived in-memory snapshot of the last validated token.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tokio::time::Instant;

use crate::types::Token;

/// Cached token plus the moment it was fetched.
#[derive(Clone, Debug)]
pub struct CachedToken {
    pub token: Token,
    pub fetched_at: Instant,
    /// Set when an expired token is served during the grace period; the entry
    /// stays usable until this instant instead of following the expiry rule.
    pub stale_until: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_usable(&self, now: DateTime<Utc>, validity: Duration, threshold: Duration) -> bool {
        if self.fetched_at.elapsed() >= validity {
            return false;
        }
        match self.stale_until {
            Some(until) => now < until,
            None => !self.token.needs_refresh(now, threshold),
        }
    }
}

/// In-memory token cache.
///
/// Reads share the lock; replacements are exclusive. Every write is tagged
/// with the credential epoch observed when the token was loaded, and
/// [`TokenCache::invalidate`] bumps the epoch, so a load that raced a clear can
/// never repopulate the cache.
#[derive(Debug, Default)]
pub struct TokenCache {
    entry: RwLock<Option<CachedToken>>,
    epoch: AtomicU64,
}

impl TokenCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current credential epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Return the cached token if it is still fresh enough to hand out.
    pub async fn get(
        &self,
        now: DateTime<Utc>,
        validity: Duration,
        threshold: Duration,
    ) -> Option<Token> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|cached| cached.is_usable(now, validity, threshold))
            .map(|cached| cached.token.clone())
    }

    /// Replace the snapshot, unless the credentials were cleared after `epoch`.
    pub async fn put(&self, token: Token, epoch: u64) -> bool {
        self.replace(token, None, epoch).await
    }

    /// Cache an expired token that may be served until `stale_until`.
    pub async fn put_stale(&self, token: Token, stale_until: DateTime<Utc>, epoch: u64) -> bool {
        self.replace(token, Some(stale_until), epoch).await
    }

    async fn replace(&self, token: Token, stale_until: Option<DateTime<Utc>>, epoch: u64) -> bool {
        let mut entry = self.entry.write().await;
        if self.epoch() != epoch {
            return false;
        }
        *entry = Some(CachedToken {
            token,
            fetched_at: Instant::now(),
            stale_until,
        });
        true
    }

    /// Drop the snapshot.
    pub async fn clear(&self) {
        *self.entry.write().await = None;
    }

    /// Clear the snapshot and start a new epoch.
    ///
    /// The returned guard holds the cache exclusively; keep it alive until the
    /// backing store has been cleared as well.
    pub async fn invalidate(&self) -> RwLockWriteGuard<'_, Option<CachedToken>> {
        let mut entry = self.entry.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *entry = None;
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const VALIDITY: Duration = Duration::from_secs(60);
    const THRESHOLD: Duration = Duration::from_secs(300);

    fn fresh_token() -> Token {
        Token::new("access-token-value").with_expiry(Utc::now() + ChronoDuration::hours(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_within_validity_window() {
        let cache = TokenCache::new();
        assert!(cache.get(Utc::now(), VALIDITY, THRESHOLD).await.is_none());

        let token = fresh_token();
        assert!(cache.put(token.clone(), cache.epoch()).await);
        assert_eq!(cache.get(Utc::now(), VALIDITY, THRESHOLD).await, Some(token));

        tokio::time::advance(VALIDITY).await;
        assert!(cache.get(Utc::now(), VALIDITY, THRESHOLD).await.is_none());
    }

    #[tokio::test]
    async fn test_near_expiry_is_a_miss() {
        let cache = TokenCache::new();
        let token =
            Token::new("access-token-value").with_expiry(Utc::now() + ChronoDuration::minutes(2));
        cache.put(token, cache.epoch()).await;
        assert!(cache.get(Utc::now(), VALIDITY, THRESHOLD).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_entry_served_until_deadline() {
        let cache = TokenCache::new();
        let now = Utc::now();
        let token =
            Token::new("access-token-value").with_expiry(now - ChronoDuration::minutes(1));

        cache
            .put_stale(token.clone(), now + ChronoDuration::minutes(4), cache.epoch())
            .await;
        assert_eq!(cache.get(now, VALIDITY, THRESHOLD).await, Some(token));
        assert!(cache
            .get(now + ChronoDuration::minutes(5), VALIDITY, THRESHOLD)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_invalidate_rejects_older_epoch() {
        let cache = TokenCache::new();
        let epoch = cache.epoch();
        cache.put(fresh_token(), epoch).await;

        drop(cache.invalidate().await);
        assert!(cache.get(Utc::now(), VALIDITY, THRESHOLD).await.is_none());

        assert!(!cache.put(fresh_token(), epoch).await);
        assert!(cache.get(Utc::now(), VALIDITY, THRESHOLD).await.is_none());
        assert!(cache.put(fresh_token(), cache.epoch()).await);
    }
}
