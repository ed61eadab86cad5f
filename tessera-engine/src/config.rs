// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_store::RetryPolicy;

/// Name of the advisory lock serializing all group relation changes.
pub const GROUPS_GROUPS_LOCK: &str = "groups_groups";

/// Name of the advisory lock serializing permission cache rebuilds.
pub const PERMISSIONS_LOCK: &str = "permissions";

/// Name of the advisory lock serializing result propagation.
pub const RESULTS_LOCK: &str = "results";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum time to wait for an advisory lock before failing with `LockTimeoutExceeded`.
    ///
    /// Defaults to 3 seconds.
    pub lock_timeout: Duration,

    /// Retry bounds for inserts of freshly generated identifiers (answers, attempts).
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(3),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
