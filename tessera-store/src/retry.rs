// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::sqlite::StoreError;

/// Bounds for retrying inserts which use freshly generated identifiers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of attempts before giving up with `StoreError::GeneratorExhausted`.
    ///
    /// Defaults to 3.
    pub max_attempts: u32,

    /// Waiting time before the first retry.
    ///
    /// Defaults to 0 / no backoff.
    pub initial_backoff: Duration,

    /// Minimum increment value when increasing backoff value.
    pub min_increment: Duration,

    /// Maximum increment value when increasing backoff value.
    pub max_increment: Duration,

    /// Maximum reachable backoff value.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            min_increment: Duration::from_millis(5),
            max_increment: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn no_backoff(mut self) -> Self {
        self.initial_backoff = Duration::ZERO;
        self.min_increment = Duration::ZERO;
        self.max_increment = Duration::ZERO;
        self.max_backoff = Duration::ZERO;
        self
    }
}

/// Simple, incremental backoff logic.
///
/// It starts at an initial value and gets incremented by a random value within the configured
/// range until it hits a ceiling.
#[derive(Debug)]
pub struct Backoff {
    value: Duration,
    policy: RetryPolicy,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            value: policy.initial_backoff,
            policy,
        }
    }

    pub fn value(&self) -> Duration {
        self.value
    }

    pub fn increment(&mut self) {
        if self.value >= self.policy.max_backoff {
            self.value = self.policy.max_backoff;
            return;
        }

        self.value = (self.value + self.random_increment()).min(self.policy.max_backoff);
    }

    pub async fn sleep(&self) {
        if self.value.is_zero() {
            return;
        }

        trace!("backoff {} milliseconds", self.value.as_millis());
        tokio::time::sleep(self.value).await;
    }

    fn random_increment(&self) -> Duration {
        let min = self.policy.min_increment.as_millis() as u64;
        let max = self.policy.max_increment.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }

        Duration::from_millis(rand::random_range(min..max))
    }
}

/// Runs `f` until it no longer fails with a duplicate key, at most `policy.max_attempts` times.
///
/// `f` receives the zero-based attempt number and is expected to generate a fresh identifier on
/// every call. Any error other than `StoreError::DuplicateKey` is returned right away.
pub async fn retry_on_duplicate_key<F, R>(policy: &RetryPolicy, mut f: F) -> Result<R, StoreError>
where
    F: AsyncFnMut(u32) -> Result<R, StoreError>,
{
    let mut backoff = Backoff::new(policy.clone());

    for attempt in 0..policy.max_attempts {
        match f(attempt).await {
            Err(StoreError::DuplicateKey(key)) => {
                debug!(attempt, %key, "insert collided with existing key, retrying");
                backoff.sleep().await;
                backoff.increment();
            }
            result => return result,
        }
    }

    Err(StoreError::GeneratorExhausted {
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Backoff, RetryPolicy, retry_on_duplicate_key};
    use crate::sqlite::StoreError;

    #[test]
    fn increment() {
        let policy = RetryPolicy::default();
        let mut backoff = Backoff::new(policy.clone());

        // Backoff should be at initial value in the beginning.
        assert_eq!(backoff.value(), policy.initial_backoff);

        let mut last_value = backoff.value();
        for _ in 0..100 {
            backoff.increment();

            // Increments should gradually increase backoff until it hits the ceiling.
            assert!(backoff.value() >= last_value);
            assert!(backoff.value() <= policy.max_backoff);
            if last_value < policy.max_backoff {
                assert!(backoff.value() - last_value <= policy.max_increment);
            }
            last_value = backoff.value();
        }

        assert_eq!(backoff.value(), policy.max_backoff);
    }

    #[tokio::test]
    async fn retries_on_duplicate_key() {
        let policy = RetryPolicy::default().no_backoff();

        let mut calls = 0;
        let result = retry_on_duplicate_key(&policy, async |attempt| {
            calls += 1;
            if attempt < 2 {
                Err(StoreError::DuplicateKey("answers.id".into()))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::default().max_attempts(4).no_backoff();

        let mut calls = 0;
        let result: Result<(), _> = retry_on_duplicate_key(&policy, async |_| {
            calls += 1;
            Err(StoreError::DuplicateKey("answers.id".into()))
        })
        .await;

        assert!(matches!(
            result,
            Err(StoreError::GeneratorExhausted { attempts: 4 })
        ));
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };

        let mut calls = 0;
        let result: Result<(), _> = retry_on_duplicate_key(&policy, async |_| {
            calls += 1;
            Err(StoreError::Deadlock)
        })
        .await;

        assert!(matches!(result, Err(StoreError::Deadlock)));
        assert_eq!(calls, 1);
    }
}
