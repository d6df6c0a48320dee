//! Background Refresher
//!
//! Long-lived task that renews the stored token before callers need it.

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::CallContext;
use crate::error::{AuthError, AuthResult, ConfigurationError};
use crate::token::manager::ManagerInner;
use crate::types::Token;

/// Decide whether the background task should renew `token` now.
///
/// Providers do not report issue time, so it is estimated as `expiry -
/// estimated_lifetime`. If that estimate lies in the future the token outlives
/// the nominal lifetime and is renewed once half of that lifetime remains;
/// otherwise it is renewed once the used fraction reaches `threshold`.
pub fn should_background_refresh(
    token: &Token,
    now: DateTime<Utc>,
    estimated_lifetime: Duration,
    threshold: f64,
) -> bool {
    let Some(expiry) = token.expiry else {
        return false;
    };
    if !token.has_refresh_token() {
        return false;
    }
    let Ok(lifetime) = chrono::Duration::from_std(estimated_lifetime) else {
        return false;
    };
    if lifetime <= chrono::Duration::zero() {
        return false;
    }

    let Some(issued) = expiry.checked_sub_signed(lifetime) else {
        return false;
    };
    if issued > now {
        return expiry - now <= lifetime / 2;
    }

    let used = (now - issued).num_milliseconds() as f64;
    used / lifetime.num_milliseconds() as f64 >= threshold
}

/// Handle to the background refresh task.
///
/// The task holds only a weak reference to the manager, so it never keeps
/// the manager alive on its own.
#[derive(Debug)]
pub struct BackgroundRefresher {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundRefresher {
    /// Spawn the refresh loop on the current Tokio runtime.
    pub(crate) fn spawn(manager: Weak<ManagerInner>) -> AuthResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            AuthError::Configuration(ConfigurationError::InvalidValue {
                field: "runtime",
                message: format!("background refresh needs a Tokio runtime: {}", e),
            })
        })?;

        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run(manager, cancel.clone()));

        Ok(Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ask the loop to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check if the loop is still running.
    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and wait until it has exited.
    ///
    /// An in-progress tick is cancelled through its context. Calling this more
    /// than once is harmless.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(error = %e, "background refresher ended abnormally");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run(manager: Weak<ManagerInner>, cancel: CancellationToken) {
    info!("background token refresher started");

    loop {
        // Re-read each round so set_refresh_config takes effect.
        let Some(interval) = manager
            .upgrade()
            .map(|m| m.refresh_config().background_refresh_interval)
        else {
            break;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(inner) = manager.upgrade() else {
            break;
        };
        let tick_timeout = inner.refresh_config().background_tick_timeout;
        let ctx = CallContext::with_cancellation(cancel.child_token()).with_timeout(tick_timeout);
        inner.background_tick(&ctx).await;
    }

    info!("background token refresher stopped");
}
