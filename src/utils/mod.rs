//! Shared helpers

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Retry an async operation with bounded exponential back-off and jitter.
///
/// `op` is attempted up to `max_attempts` times. The delay before attempt
/// `n` (1-based) is `base_delay * 2^(n-1)` plus up to half of `base_delay`
/// of jitter, capped at 5 seconds. The last error is returned when the
/// budget is exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    const MAX_DELAY: Duration = Duration::from_secs(5);

    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts.max(1) {
                    return Err(err);
                }
                let exp = base_delay.saturating_mul(1 << (attempt - 1).min(16));
                let jitter_ms = rand::thread_rng().gen_range(0..=base_delay.as_millis().max(1) as u64 / 2);
                let delay = exp.saturating_add(Duration::from_millis(jitter_ms)).min(MAX_DELAY);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, err = %err, "Retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_budget_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {n}")) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
