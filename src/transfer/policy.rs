//! Retry policy and cooperative cancellation.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

/// How often, and how many times, to retry an operation.
///
/// `max_attempts: None` retries until the operation succeeds, fails fatally, or
/// the transfer is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub const fn unbounded(backoff_ms: u64) -> Self {
        Self {
            max_attempts: None,
            backoff_ms,
        }
    }

    pub const fn limited(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff_ms,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Whether retry number `attempt` (1-based) is allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::unbounded(250)
    }
}

/// Shared flag a caller sets to stop a transfer.
///
/// A wait already in progress is woken immediately; clones share one flag.
#[derive(Debug, Clone)]
pub struct CancelFlag(Arc<watch::Sender<bool>>);

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a wait did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exhausted,
    Cancelled,
}

/// Sleep before retry number `attempt`, honouring the policy and `cancel`.
pub async fn wait_before(
    policy: &RetryPolicy,
    attempt: u32,
    cancel: &CancelFlag,
) -> Result<(), WaitOutcome> {
    if cancel.is_cancelled() {
        return Err(WaitOutcome::Cancelled);
    }
    if !policy.allows(attempt) {
        return Err(WaitOutcome::Exhausted);
    }
    if policy.backoff_ms > 0 {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitOutcome::Cancelled),
            _ = sleep(policy.backoff()) => {}
        }
    }
    Ok(())
}
