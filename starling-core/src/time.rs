//! Time provider abstraction.
//!
//! All cluster time arithmetic works with `Duration` values measured from the
//! provider's epoch (its creation instant). Components store timestamps as
//! plain `Duration`s and compare them with `saturating_sub`, which keeps the
//! arithmetic provider-agnostic.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for time operations.
///
/// Implementations handle sleeping and reading the current time appropriate
/// for their environment. `now()` is monotonic and starts at zero when the
/// provider is created.
#[async_trait]
pub trait TimeProvider: Clone + Send + Sync + 'static {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Get the current time as elapsed duration since provider creation.
    ///
    /// Use this for lease/TTL comparisons and idle-time bookkeeping.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within the timeout,
    /// or `Err(TimeError::Elapsed)` if it times out.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T> + Send,
        T: Send;
}

/// Real time provider using Tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: std::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T> + Send,
        T: Send,
    {
        match tokio::time::timeout(duration, future).await {
            Ok(result) => Ok(result),
            Err(_) => Err(TimeError::Elapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_now_advances() {
        let time = TokioTimeProvider::new();
        let before = time.now();
        time.sleep(Duration::from_millis(10)).await;
        let after = time.now();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_timeout_completes_in_time() {
        let time = TokioTimeProvider::new();
        let result = time
            .timeout(Duration::from_secs(1), async { 42u32 })
            .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_timeout_elapses() {
        let time = TokioTimeProvider::new();
        let slow = time.sleep(Duration::from_secs(10));
        let result = time.timeout(Duration::from_millis(10), slow).await;
        assert_eq!(result, Err(TimeError::Elapsed));
    }
}
