use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

/// Delay before retry number `attempt` (1-based): 500ms * attempt.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(500 * attempt as u64)
}

/// Retry an async operation with linear backoff.
///
/// Calls `f` up to `max_attempts` times, sleeping `backoff_delay(attempt)`
/// between failures. Returns the first success or the last error.
pub async fn retry_with_backoff<F, Fut, T, E>(max_attempts: u32, label: &str, f: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    label, attempt, max_attempts, e
                );
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("{} failed after {} attempts: {}", label, attempt, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(3, "flaky", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("failure {}", n))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(2, "broken", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("failure {}", n))
        })
        .await;
        assert_eq!(result, Err("failure 2".to_string()));
    }

    #[test]
    fn test_backoff_is_linear() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(3), Duration::from_millis(1500));
    }
}
