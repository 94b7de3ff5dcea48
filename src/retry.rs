//! Bounded exponential backoff with jitter

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    /// Jitter fraction: each delay is scaled by a random factor in
    /// `1 - jitter ..= 1 + jitter`
    pub jitter: f64,
}

impl Default for Backoff {
    /// 4 attempts, 1s initial delay doubling each time, 10% jitter
    fn default() -> Self {
        Self {
            attempts: 4,
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-based), jittered
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        let scale = if self.jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        Duration::from_secs_f64((base * scale).max(0.0))
    }
}

/// Run `operation` until it succeeds, `retriable` rejects the error, or the
/// attempts are exhausted. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    backoff: &Backoff,
    operation_name: &str,
    retriable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !retriable(&e) || attempt >= backoff.attempts.max(1) => return Err(e),
            Err(e) => {
                let delay = backoff.delay(attempt - 1);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> Backoff {
        Backoff {
            attempts,
            initial_delay: Duration::from_millis(1),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let backoff = Backoff {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            let d = backoff.delay(1).as_secs_f64();
            assert!((1.8..=2.2).contains(&d), "delay {d} out of bounds");
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<u32, String> = retry_with_backoff(&fast(4), "op", |_| true, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), String> = retry_with_backoff(&fast(4), "op", |_| true, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retriable_error_stops_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), String> =
            retry_with_backoff(&fast(4), "op", |e: &String| e != "fatal", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                }
            })
            .await;
        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
