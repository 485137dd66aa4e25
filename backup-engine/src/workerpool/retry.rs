//! Retry policy for transfer tasks.
//!
//! Tasks never loop on their own; they hand the operation to
//! [`RetryPolicy::run`], which decides from the error whether another attempt
//! makes sense and how long to wait before it.

use crate::utils::errors::{EngineError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; `None` retries until success
    /// or cancellation.
    pub max_attempts: Option<u32>,
    /// Pause after the first failure.
    pub delay: Duration,
    /// Growth factor applied to the pause after every further failure.
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay: Duration::from_secs(5),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Fixed pause, unbounded attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_delay: delay,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = if attempts == 0 { None } else { Some(attempts) };
        self
    }

    /// Pause after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let secs = self.delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_delay.as_secs_f64().max(self.delay.as_secs_f64()));
        Duration::from_secs_f64(capped)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or `cancel` fires.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            attempt += 1;

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if let Some(max) = self.max_attempts {
                if attempt >= max {
                    warn!("{} failed after {} attempts: {}", what, attempt, err);
                    return Err(err);
                }
            }

            let pause = self.delay_for(attempt);
            warn!("{} failed (attempt {}): {}. Retrying in {:?}", what, attempt, err, pause);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(1))
    }

    fn transient() -> EngineError {
        EngineError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let value = quick()
            .run(&cancel, "flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = quick()
            .run(&cancel, "missing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::SourceNotFound("a".into()))
            })
            .await;

        assert!(matches!(result, Err(EngineError::SourceNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = quick()
            .with_max_attempts(3)
            .run(&cancel, "down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pause() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::fixed(Duration::from_secs(3600));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<()> = policy.run(&cancel, "stuck", || async { Err(transient()) }).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[test]
    fn test_backoff_curve() {
        let policy = RetryPolicy {
            max_attempts: None,
            delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));

        let fixed = RetryPolicy::default();
        assert_eq!(fixed.delay_for(10), Duration::from_secs(5));
    }
}
