// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{trace, warn};

use crate::sqlite::StoreError;

/// Registry of named advisory locks shared by all clones of a store.
///
/// Every name maps to its own async mutex which is created on first use and kept around
/// afterwards. The set of names in use is small and static (one per serialized operation
/// family), so entries are never evicted.
#[derive(Clone, Debug, Default)]
pub struct NamedLocks {
    inner: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Holds a named lock until dropped.
#[derive(Debug)]
pub struct NamedLockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        trace!(name = %self.name, "released named lock");
    }
}

impl NamedLocks {
    fn entry(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Waits at most `timeout` for the lock `name`.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<NamedLockGuard, StoreError> {
        let mutex = self.entry(name);

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                trace!(%name, "acquired named lock");
                Ok(NamedLockGuard {
                    name: name.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => {
                warn!(%name, ?timeout, "timed out waiting for named lock");
                Err(StoreError::LockTimeout(name.to_string()))
            }
        }
    }

    /// Returns `true` if someone currently holds the lock `name`.
    pub fn is_locked(&self, name: &str) -> bool {
        let mutex = self.entry(name);
        let locked = mutex.try_lock().is_err();
        locked
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::NamedLocks;
    use crate::sqlite::StoreError;

    #[tokio::test]
    async fn locks_are_independent_per_name() {
        let locks = NamedLocks::default();

        let a = locks.acquire("a", Duration::from_millis(10)).await.unwrap();
        let b = locks.acquire("b", Duration::from_millis(10)).await.unwrap();
        assert_eq!(a.name(), "a");
        assert_eq!(b.name(), "b");
        assert!(locks.is_locked("a"));

        assert!(matches!(
            locks.acquire("a", Duration::from_millis(10)).await,
            Err(StoreError::LockTimeout(name)) if name == "a"
        ));

        drop(a);
        assert!(!locks.is_locked("a"));
        assert!(locks.acquire("a", Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn clones_share_locks() {
        let locks = NamedLocks::default();
        let other = locks.clone();

        let _guard = locks.acquire("shared", Duration::from_millis(10)).await.unwrap();
        assert!(other.is_locked("shared"));
    }
}
