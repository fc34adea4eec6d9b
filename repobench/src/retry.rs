//! Linear retries for per-item operations.

use std::future::Future;
use std::time::Duration;

/// Number of attempts made for every work item by default.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Delay between two attempts by default.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(200);

/// A fixed retry strategy: a number of attempts with a constant delay in between.
///
/// There is no exponential growth and no jitter. The delay is only slept between two attempts,
/// never after the last one. Running the policy is not cancellation aware, an attempt or a delay
/// that has started always runs to completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy making `attempts` tries with `delay` between them.
    ///
    /// An attempt count of `0` is treated as a single attempt.
    pub const fn linear(attempts: u32, delay: Duration) -> Self {
        let attempts = if attempts == 0 { 1 } else { attempts };
        Self { attempts, delay }
    }

    /// Creates a policy that retries without waiting in between.
    pub const fn immediate(attempts: u32) -> Self {
        Self::linear(attempts, Duration::ZERO)
    }

    /// The total number of attempts, including the first one.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The delay slept between two attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Runs `op` until it succeeds or all attempts are used up.
    ///
    /// Returns the first success, or the error of the last attempt.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.attempts => return Err(err),
                Err(_) => {
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(DEFAULT_ATTEMPTS, DEFAULT_DELAY)
    }
}
