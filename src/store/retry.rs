//! Bounded retry for durable writes.

use std::thread;
use std::time::Duration;

use log::warn;

use super::Result;

/// How many times a write is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only transient errors are retried. The delay doubles after every
    /// failed attempt.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.backoff;
        let mut attempt = 1;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        what, attempt, attempts, e, delay
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

impl From<&crate::config::EngineConfig> for RetryPolicy {
    fn from(config: &crate::config::EngineConfig) -> Self {
        Self::new(config.persist_retries, config.retry_backoff())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::cell::Cell;
    use std::io;

    fn transient() -> StoreError {
        StoreError::Io(io::Error::new(io::ErrorKind::Other, "disk hiccup"))
    }

    #[test]
    fn test_retries_transient_until_success() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result = policy.run("write", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(transient())
            } else {
                Ok(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_attempts() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let result: Result<()> = policy.run("write", || {
            calls.set(calls.get() + 1);
            Err(transient())
        });

        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = RetryPolicy::default().run("write", || {
            calls.set(calls.get() + 1);
            Err(StoreError::not_found("pipeline", "x"))
        });

        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(calls.get(), 1);
    }
}
