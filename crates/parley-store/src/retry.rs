//! Retry policy for backend startup.
//!
//! Databases are often started alongside the service that uses them, so a
//! backend keeps retrying its connect-and-bootstrap sequence until it
//! succeeds. Only errors classified by [`StoreError::is_transient`] are
//! retried; everything else is returned immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::StoreError;

/// Default delay between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Waits between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fixed-delay retry policy, unbounded by default.
#[derive(Clone)]
pub struct RetryPolicy {
    delay: Duration,
    max_attempts: Option<u32>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            max_attempts: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("delay", &self.delay)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Retry forever with the default delay.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Set the delay between attempts.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Give up after `attempts` attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Replace the sleeper.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Delay between attempts.
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `operation` until it succeeds or fails with a non-transient error.
    ///
    /// `operation` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient error
    /// once the attempt budget is exhausted.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut attempt: u32 = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(error);
                    }
                    warn!(
                        attempt = attempt,
                        delay_secs = self.delay.as_secs_f64(),
                        error = %error,
                        "storage not ready, retrying"
                    );
                    self.sleeper.sleep(self.delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use parking_lot::Mutex;

    use super::*;

    /// Records requested sleeps without waiting.
    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().push(duration);
        }
    }

    fn policy(sleeper: &Arc<RecordingSleeper>) -> RetryPolicy {
        RetryPolicy::unbounded()
            .with_delay(Duration::from_millis(250))
            .with_sleeper(Arc::clone(sleeper) as Arc<dyn Sleeper>)
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let result = policy(&sleeper)
            .run(|attempt| async move {
                if attempt < 4 {
                    Err(StoreError::connection("database is starting up"))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 4);
        assert_eq!(*sleeper.sleeps.lock(), vec![Duration::from_millis(250); 3]);
    }

    #[tokio::test]
    async fn non_transient_error_is_returned_immediately() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let result: Result<(), _> = policy(&sleeper)
            .run(|_| async { Err(StoreError::config("bad dialect")) })
            .await;

        assert!(matches!(result, Err(StoreError::Config { .. })));
        assert!(sleeper.sleeps.lock().is_empty());
    }

    #[tokio::test]
    async fn bounded_policy_gives_up() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let result: Result<(), _> = policy(&sleeper)
            .with_max_attempts(2)
            .run(|_| async { Err(StoreError::connection("refused")) })
            .await;

        assert!(matches!(result, Err(StoreError::Connection { .. })));
        assert_eq!(sleeper.sleeps.lock().len(), 1);
    }
}
