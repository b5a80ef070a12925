//! Retry utilities: submission backoff policy and transient error classification.
//!
//! Batcher submissions use a deterministic capped exponential schedule so the
//! attempt budget maps to a predictable worst-case latency. Reconnecting
//! outcome feeds use `backon` with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;
use tonic::{Code, Status};

/// Submission retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Maximum delay between two attempts.
    pub max_delay: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

impl RetryConfig {
    /// Delay to wait before `attempt` (1-indexed).
    ///
    /// The first attempt runs immediately; attempt n >= 2 waits
    /// `base * 2^(n-2)`, capped at `max_delay`.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << exponent);
        let capped_ms = exponential_ms.min(self.max_delay.as_millis().min(u64::MAX as u128) as u64);
        Duration::from_millis(capped_ms)
    }

    /// Whether another attempt may follow `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Backoff for re-subscribing to a batcher's outcome stream.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Unbounded attempts; the feed lives as long as the process
/// - Jitter enabled
pub fn outcome_feed_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .without_max_times()
        .with_jitter()
}

/// Determines if a gRPC error from a batcher is transient.
///
/// Transient codes (retried):
/// - `Unavailable`: connection failure
/// - `DeadlineExceeded`: the batcher did not answer in time
/// - `Aborted`, `ResourceExhausted`: the batcher is busy
/// - `Unknown`, `Internal`, `Cancelled`: transport-level breakage
///
/// Everything else (`InvalidArgument`, `FailedPrecondition`, `NotFound`,
/// `PermissionDenied`, ...) is a business rejection that will never succeed
/// on retry.
pub fn is_transient_status(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable
            | Code::DeadlineExceeded
            | Code::Aborted
            | Code::ResourceExhausted
            | Code::Unknown
            | Code::Internal
            | Code::Cancelled
    )
}
