//! Deadlines with cancellation for every external call.
//!
//! A [`Deadline`] pairs an absolute instant with a [`CancellationToken`].
//! Child deadlines share the parent's cancellation but may be tighter.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Stand-in for "no deadline" on detached work
const UNBOUNDED: Duration = Duration::from_secs(86_400 * 365);

#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    token: CancellationToken,
}

impl Deadline {
    /// A fresh deadline `timeout` from now with its own cancellation scope.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            token: CancellationToken::new(),
        }
    }

    /// A fresh scope bounded only by `limit` (`None` = effectively unbounded).
    ///
    /// Used for background work that must outlive the caller that started it.
    pub fn detached(limit: Option<Duration>) -> Self {
        Self::after(limit.unwrap_or(UNBOUNDED))
    }

    /// Replace the cancellation token, e.g. to tie this deadline to a caller's scope.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Same instant, child cancellation scope.
    pub fn child(&self) -> Self {
        Self {
            at: self.at,
            token: self.token.child_token(),
        }
    }

    /// Child scope whose instant is the earlier of ours and `now + limit`.
    pub fn tighten(&self, limit: Duration) -> Self {
        Self {
            at: self.at.min(Instant::now() + limit),
            token: self.token.child_token(),
        }
    }

    /// Drive `fut` until it finishes, the deadline passes, or the scope is cancelled.
    pub async fn guard<F, T, E>(&self, fut: F, on_timeout: E, on_cancel: E) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(on_cancel),
            _ = tokio::time::sleep_until(self.at) => Err(on_timeout),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_guard_times_out() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let res: Result<(), &str> = deadline
            .guard(
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                "timeout",
                "cancelled",
            )
            .await;
        assert_eq!(res, Err("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_observes_parent_cancellation() {
        let parent = Deadline::after(Duration::from_secs(10));
        let child = parent.tighten(Duration::from_secs(20));
        assert_eq!(child.instant(), parent.instant());

        parent.cancel();
        let res: Result<(), &str> = child
            .guard(std::future::pending(), "timeout", "cancelled")
            .await;
        assert_eq!(res, Err("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_cancel_does_not_reach_parent() {
        let parent = Deadline::after(Duration::from_secs(1));
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tighten_picks_earlier_instant() {
        let parent = Deadline::after(Duration::from_secs(10));
        let tight = parent.tighten(Duration::from_secs(1));
        assert!(tight.instant() < parent.instant());
        assert_eq!(tight.remaining(), Duration::from_secs(1));
    }
}
