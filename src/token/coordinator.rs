//! Refresh Coordinator
//!
//! Single-flight refresh: at most one exchange runs at a time and late
//! arrivals wait for its outcome instead of starting their own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::CallContext;
use crate::error::{AuthError, AuthResult, RefreshError};
use crate::types::Token;

/// Snapshot of the refresh state machine.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshState {
    /// A refresh is currently executing.
    pub in_flight: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Failed exchange attempts since the last success.
    pub consecutive_failures: u32,
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<AuthError>,
    /// Number of completed refresh operations.
    pub generation: u64,
}

fn serialize_error<S>(error: &Option<AuthError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

#[derive(Clone, Debug)]
enum Outcome {
    Refreshed(Token),
    Failed(AuthError),
    /// The leader went away before finishing; joiners start over.
    Abandoned,
}

#[derive(Debug, Default)]
struct Inner {
    state: RefreshState,
    last_outcome: Option<Outcome>,
}

/// Role handed out by [`RefreshCoordinator::begin`].
enum Role<'a> {
    Leader(InFlightGuard<'a>),
    /// A refresh finished after the caller's observation; reuse its token.
    Completed(Token),
    Follower {
        rx: watch::Receiver<u64>,
        generation: u64,
    },
}

/// Owns the refresh state and the completion broadcast.
///
/// Foreground callers and the background refresher go through the same
/// [`RefreshCoordinator::begin`] transition, so both share one mutual
/// exclusion guarantee.
#[derive(Debug)]
pub struct RefreshCoordinator {
    inner: Mutex<Inner>,
    completed: watch::Sender<u64>,
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshCoordinator {
    /// Create a coordinator in the idle state.
    pub fn new() -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            completed,
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> RefreshState {
        self.lock().state.clone()
    }

    /// Number of completed refresh operations.
    ///
    /// Read it before loading the token that will be refreshed and pass it to
    /// [`RefreshCoordinator::refresh_or_join`].
    pub fn generation(&self) -> u64 {
        self.lock().state.generation
    }

    /// Check if a refresh is executing.
    pub fn is_in_flight(&self) -> bool {
        self.lock().state.in_flight
    }

    /// Forget counters, timestamps and the last error.
    ///
    /// An in-flight refresh keeps its flag; it clears it itself on completion.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let in_flight = inner.state.in_flight;
        let generation = inner.state.generation;
        inner.state = RefreshState {
            in_flight,
            generation,
            ..Default::default()
        };
        inner.last_outcome = None;
    }

    /// Record one failed exchange attempt of the running refresh.
    pub fn record_failure(&self, error: &AuthError) {
        let mut inner = self.lock();
        inner.state.consecutive_failures = inner.state.consecutive_failures.saturating_add(1);
        inner.state.last_error = Some(error.clone());
    }

    /// Run `refresh` as the leader, or wait for the refresh already in flight.
    ///
    /// Joiners wait at most `join_timeout` and receive the leader's outcome. A
    /// leader that is cancelled or dropped hands leadership to the next caller.
    /// If a refresh succeeded after `observed` (a [`RefreshCoordinator::generation`]
    /// value), its token is returned and `refresh` is not run.
    pub async fn refresh_or_join<F, Fut>(
        &self,
        ctx: &CallContext,
        observed: u64,
        join_timeout: Duration,
        refresh: F,
    ) -> AuthResult<Token>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<Token>>,
    {
        let mut refresh = Some(refresh);
        loop {
            match self.begin(observed) {
                Role::Completed(token) => {
                    debug!(observed, "refresh completed since token was loaded");
                    return Ok(token);
                }
                Role::Leader(guard) => {
                    let Some(refresh) = refresh.take() else {
                        return Err(RefreshError::Exchange {
                            message: "refresh already attempted".to_string(),
                        }
                        .into());
                    };
                    debug!("refresh leader");
                    let result = refresh().await;
                    guard.complete(&result);
                    return result;
                }
                Role::Follower { rx, generation } => {
                    debug!(generation, "joining in-flight refresh");
                    match self.join(ctx, rx, generation, join_timeout).await? {
                        Outcome::Refreshed(token) => return Ok(token),
                        Outcome::Failed(error) => return Err(error),
                        Outcome::Abandoned => continue,
                    }
                }
            }
        }
    }

    /// Run `refresh` only if nothing is in flight and no refresh succeeded
    /// after `observed`; `None` means it was skipped.
    pub async fn refresh_if_idle<F, Fut>(
        &self,
        observed: u64,
        refresh: F,
    ) -> Option<AuthResult<Token>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<Token>>,
    {
        match self.begin(observed) {
            Role::Leader(guard) => {
                let result = refresh().await;
                guard.complete(&result);
                Some(result)
            }
            Role::Follower { .. } | Role::Completed(_) => None,
        }
    }

    fn begin(&self, observed: u64) -> Role<'_> {
        let mut inner = self.lock();
        if inner.state.in_flight {
            return Role::Follower {
                rx: self.completed.subscribe(),
                generation: inner.state.generation,
            };
        }

        if inner.state.generation > observed {
            if let Some(Outcome::Refreshed(token)) = &inner.last_outcome {
                return Role::Completed(token.clone());
            }
        }

        inner.state.in_flight = true;
        inner.state.last_attempt = Some(Utc::now());
        Role::Leader(InFlightGuard {
            coordinator: self,
            finished: false,
        })
    }

    async fn join(
        &self,
        ctx: &CallContext,
        mut rx: watch::Receiver<u64>,
        generation: u64,
        join_timeout: Duration,
    ) -> AuthResult<Outcome> {
        let wait = ctx.run("refresh_join", async {
            rx.wait_for(|completed| *completed > generation)
                .await
                .map(|_| ())
                .map_err(|_| AuthError::Cancelled {
                    operation: "refresh_join",
                })
        });

        match tokio::time::timeout(join_timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    waited_ms = join_timeout.as_millis() as u64,
                    "in-flight refresh did not complete in time"
                );
                return Err(RefreshError::JoinTimeout {
                    waited: join_timeout,
                }
                .into());
            }
        }

        Ok(self.lock().last_outcome.clone().unwrap_or(Outcome::Abandoned))
    }

    fn finish(&self, outcome: Outcome) {
        let mut inner = self.lock();
        let now = Utc::now();
        match &outcome {
            Outcome::Refreshed(_) => {
                inner.state.last_success = Some(now);
                inner.state.consecutive_failures = 0;
                inner.state.last_error = None;
            }
            Outcome::Failed(error) => inner.state.last_error = Some(error.clone()),
            Outcome::Abandoned => {}
        }
        inner.state.in_flight = false;
        inner.state.generation += 1;
        inner.last_outcome = Some(outcome);
        // Published under the lock so the broadcast value never goes backwards.
        self.completed.send_replace(inner.state.generation);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the refresh leader; releases the in-flight flag exactly once.
///
/// Dropping it without [`InFlightGuard::complete`] (a cancelled or panicking
/// leader) marks the refresh abandoned so joiners retry.
struct InFlightGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    finished: bool,
}

impl InFlightGuard<'_> {
    fn complete(mut self, result: &AuthResult<Token>) {
        self.finished = true;
        let outcome = match result {
            Ok(token) => Outcome::Refreshed(token.clone()),
            Err(error) if error.is_cancellation() => Outcome::Abandoned,
            Err(error) => Outcome::Failed(error.clone()),
        };
        self.coordinator.finish(outcome);
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("refresh leader dropped before completion");
            self.coordinator.finish(Outcome::Abandoned);
        }
    }
}
