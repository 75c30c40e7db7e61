//! Retry with exponential backoff and jitter.
//!
//! One primitive shared by the ingest handler and the stream supervisor, so
//! the same loop is not spelled twice.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use log::{error, warn};
use rand::Rng;

/// Future type returned by a retryable operation; boxed so the operation can
/// borrow its context mutably across attempts.
pub type RetryFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Backoff policy: delay before retry `attempt` (0-based) is
/// `base_delay * 2^attempt`, capped, then multiplied by a jitter factor drawn
/// uniformly from `jitter`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap: Duration,
    pub jitter: (f64, f64),
}

impl Backoff {
    pub const fn new(max_attempts: u32, base_delay: Duration, cap: Duration) -> Self {
        Backoff { max_attempts, base_delay, cap, jitter: (0.9, 1.1) }
    }

    /// The jittered delay to sleep before retry `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(31) as i32);
        let capped = raw.min(self.cap.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(self.jitter.0..=self.jitter.1);
        Duration::from_secs_f64(capped * jitter)
    }

    /// Run `op` against `ctx` until it succeeds or `max_attempts` are
    /// exhausted; the last error is returned to the caller.
    pub async fn retry<C, T, E, F>(&self, what: &str, ctx: &mut C, mut op: F) -> Result<T, E>
    where
        C: ?Sized,
        F: for<'a> FnMut(&'a mut C) -> RetryFuture<'a, T, E>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op(ctx).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= self.max_attempts => {
                    error!("{what} failed after {} attempts: {e}", self.max_attempts);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{what} attempt {} failed, retrying in {:.1}s: {e}",
                        attempt + 1,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Backoff {
        Backoff::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let b = policy();
        for (attempt, expected) in [(0u32, 1.0f64), (1, 2.0), (2, 4.0), (10, 30.0)] {
            let d = b.delay_for(attempt).as_secs_f64();
            assert!(
                d >= expected * 0.9 - 1e-9 && d <= expected * 1.1 + 1e-9,
                "attempt {attempt}: {d} out of bounds around {expected}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_a_later_attempt() {
        let mut calls = 0u32;
        let result: Result<u32, String> = policy()
            .retry("op", &mut calls, |calls| {
                *calls += 1;
                let n = *calls;
                Box::pin(async move {
                    if n < 3 {
                        Err("transient".to_string())
                    } else {
                        Ok(n)
                    }
                })
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let mut calls = 0u32;
        let start = tokio::time::Instant::now();
        let result: Result<(), String> = policy()
            .retry("op", &mut calls, |calls| {
                *calls += 1;
                Box::pin(async { Err("still broken".to_string()) })
            })
            .await;
        assert_eq!(result, Err("still broken".to_string()));
        assert_eq!(calls, 3);

        // Two sleeps: ~1s and ~2s, within jitter bounds.
        let elapsed = start.elapsed().as_secs_f64();
        assert!(elapsed >= 3.0 * 0.9 && elapsed <= 3.0 * 1.1, "slept {elapsed}s");
    }

    #[tokio::test(start_paused = true)]
    async fn context_mutations_survive_across_attempts() {
        let mut log: Vec<u32> = Vec::new();
        let result: Result<(), String> = policy()
            .retry("op", &mut log, |log| {
                log.push(log.len() as u32);
                Box::pin(async { Err("nope".to_string()) })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(log, vec![0, 1, 2]);
    }
}
