use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`RunContext`] stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => f.write_str("context canceled"),
            CancelReason::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

/// Cancellation scope for one renewal run
///
/// Cloning shares the same token. Derived contexts cancel with their parent
/// but can be cancelled on their own without affecting it.
#[derive(Debug, Clone)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Child context that also expires after `timeout`; the earlier deadline wins
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) if parent < deadline => parent,
                _ => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `Some` once the context is finished
    pub fn err(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => CancelReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }

    /// Sleep unless the context finishes first
    pub async fn sleep(&self, duration: Duration) -> Result<(), CancelReason> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        tokio::select! {
            reason = self.done() => Err(reason),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_propagates_to_child() {
        let parent = RunContext::new();
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.err(), None);

        parent.cancel();
        assert_eq!(child.err(), Some(CancelReason::Cancelled));
        assert_eq!(child.done().await, CancelReason::Cancelled);
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = RunContext::new();
        let child = parent.with_timeout(Duration::from_secs(60));
        child.cancel();
        assert_eq!(parent.err(), None);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let ctx = RunContext::new().with_timeout(Duration::from_millis(10));
        assert_eq!(ctx.done().await, CancelReason::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(CancelReason::DeadlineExceeded));
        assert_eq!(
            ctx.sleep(Duration::from_secs(5)).await,
            Err(CancelReason::DeadlineExceeded)
        );
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let ctx = RunContext::new();
        assert_eq!(ctx.sleep(Duration::from_millis(1)).await, Ok(()));
    }

    #[test]
    fn test_reason_messages() {
        assert_eq!(CancelReason::Cancelled.to_string(), "context canceled");
        assert_eq!(
            CancelReason::DeadlineExceeded.to_string(),
            "context deadline exceeded"
        );
    }
}
