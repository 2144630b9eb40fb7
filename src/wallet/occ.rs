//! Optimistic-concurrency retry loop
//!
//! Read row with version, compute, conditional-write, and on a lost race
//! re-read and retry with capped exponential backoff plus jitter. Retry
//! exhaustion surfaces `OPTIMISTIC_LOCK_CONFLICT`.

use rand::Rng;
use tracing::debug;

use crate::config::WalletConfig;
use crate::error::PointsError;

/// Outcome of one conditional-write attempt.
pub enum OccAttempt<T> {
    Committed(T),
    /// Version moved underneath us; re-read and retry.
    Conflict,
}

/// Backoff before retry `attempt` (1-based): base doubling per attempt,
/// with up to 50% jitter to de-synchronize contending writers.
pub fn backoff_delay(config: &WalletConfig, attempt: u32) -> std::time::Duration {
    let base = config.retry_backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    std::time::Duration::from_millis(base + jitter)
}

/// Drive an attempt closure until it commits or attempts are exhausted.
pub async fn with_occ_retry<T, F, Fut>(
    config: &WalletConfig,
    op_name: &'static str,
    mut attempt_fn: F,
) -> Result<T, PointsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<OccAttempt<T>, PointsError>>,
{
    let attempts = config.max_retry_attempts.max(1);
    for attempt in 1..=attempts {
        match attempt_fn().await? {
            OccAttempt::Committed(value) => return Ok(value),
            OccAttempt::Conflict => {
                debug!(op = op_name, attempt, "optimistic lock conflict, retrying");
                if attempt < attempts {
                    tokio::time::sleep(backoff_delay(config, attempt)).await;
                }
            }
        }
    }
    Err(PointsError::OptimisticLockConflict)
}
