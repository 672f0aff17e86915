use std::time::Duration;

use super::WarehouseError;

/// Default number of retries after a load conflict.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default backoff base; the n-th retry waits `base * 2^n`.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

const SERIALIZABLE_VIOLATION: &str = "serializable isolation violation";
const CYCLE_MARKER: &str = "transactions forming the cycle";

/// What to do after a failed load attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Exponential backoff limited to serializable-isolation conflicts.
///
/// Only the cycle form of the serializable isolation violation is transient:
/// some concurrent writer committed first and a fresh attempt will normally
/// go through. Any other warehouse error is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration) -> Self {
        Self { max_retries, base }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether `error` carries the serializable-isolation cycle signature
    pub fn is_load_conflict(error: &WarehouseError) -> bool {
        let text = error.message.to_lowercase();
        text.contains(SERIALIZABLE_VIOLATION) && text.contains(CYCLE_MARKER)
    }

    /// Delay before the `retry`-th retry (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(retry))
    }

    /// Decide after a failure; `attempt` is the number of retries already made.
    pub fn should_retry(&self, error: &WarehouseError, attempt: u32) -> RetryDecision {
        if Self::is_load_conflict(error) && attempt < self.max_retries {
            RetryDecision::RetryAfter(self.backoff(attempt + 1))
        } else {
            RetryDecision::GiveUp
        }
    }
}
