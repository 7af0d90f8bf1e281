//! Retry loop for transient store failures: exponential backoff with full
//! jitter, honouring a store's `retry_after` hint when throttled.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use crate::StoreError;

/// Backoff schedule consumed by [`retry_transient`].
pub trait Backoff: Send + Sync {
    /// Total attempts, including the first call. Always at least 1.
    fn max_attempts(&self) -> u32;

    /// Upper bound of the delay before retry number `attempt` (1-based).
    fn delay_for(&self, attempt: u32) -> Duration;
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// schedule's attempts are exhausted. The last error is returned.
///
/// A `retry_after` hint is honoured up to the schedule's largest delay.
pub async fn retry_transient<T, F, Fut>(
    schedule: &dyn Backoff,
    op_name: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = schedule.max_attempts().max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() || attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = match &e {
                    StoreError::Throttled {
                        retry_after: Some(hint),
                    } => (*hint).min(schedule.delay_for(max_attempts)),
                    _ => with_full_jitter(schedule.delay_for(attempt)),
                };
                tracing::debug!(
                    op = op_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient store failure, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Random delay in `[0, cap]`.
fn with_full_jitter(cap: Duration) -> Duration {
    let cap_ms = crate::clock::duration_millis(cap);
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
}
