//! Call Context
//!
//! Cancellation and deadline carried through every blocking operation.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AuthError;

/// Cancellation signal plus optional deadline for one logical call.
///
/// Cloning shares the cancellation signal. [`CallContext::child_with_timeout`]
/// derives a context that is cancelled with its parent but may carry a tighter
/// deadline of its own.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Context that is never cancelled and has no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context bound to an existing cancellation token.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Tighten the deadline to at most `timeout` from now.
    ///
    /// A timeout past the end of the clock leaves the deadline unchanged.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    /// Tighten the deadline to at most `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derived context: cancelled with `self`, deadline at most `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
        .with_timeout(timeout)
    }

    /// Cancel this context and every child.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the context is already done.
    pub fn check(&self, operation: &'static str) -> Result<(), AuthError> {
        if self.cancel.is_cancelled() {
            return Err(AuthError::Cancelled { operation });
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(AuthError::DeadlineExceeded { operation });
            }
        }
        Ok(())
    }

    /// Drive `future` unless the context finishes first.
    ///
    /// Cancellation and deadline are polled before the future, so a context that
    /// is already done never starts the work.
    pub async fn run<T, F>(&self, operation: &'static str, future: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, AuthError>>,
    {
        self.check(operation)?;

        let deadline = self.deadline;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AuthError::Cancelled { operation }),
            _ = sleep_until_deadline(deadline) => Err(AuthError::DeadlineExceeded { operation }),
            result = future => result,
        }
    }

    /// Sleep for `duration`, waking early with an error if the context finishes.
    pub async fn sleep(&self, operation: &'static str, duration: Duration) -> Result<(), AuthError> {
        self.run(operation, async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = CallContext::new();
        let value = ctx.run("op", async { Ok::<_, AuthError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let ctx = CallContext::new();
        ctx.cancel();
        let result = ctx.run("op", async { Ok::<_, AuthError>(()) }).await;
        assert!(matches!(result, Err(AuthError::Cancelled { operation: "op" })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_sleep() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        let result = ctx.sleep("backoff", Duration::from_secs(10)).await;
        assert!(matches!(
            result,
            Err(AuthError::DeadlineExceeded {
                operation: "backoff"
            })
        ));
    }

    #[tokio::test]
    async fn test_child_cancelled_with_parent() {
        let parent = CallContext::new();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(child.check("tick").is_err());
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_keeps_deadline() {
        let unbounded = CallContext::new().with_timeout(Duration::MAX);
        assert!(unbounded.deadline().is_none());
        assert!(unbounded.check("tick").is_ok());

        let parent = CallContext::new().with_timeout(Duration::from_secs(1));
        let child = parent.child_with_timeout(Duration::MAX);
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_child_keeps_tighter_parent_deadline() {
        let parent = CallContext::new().with_timeout(Duration::from_secs(1));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
