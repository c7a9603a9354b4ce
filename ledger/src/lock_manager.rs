//! Per-key exclusive locks for the in-memory backend.
//!
//! Each key maps to an async mutex. A unit holds the owned guard until it
//! commits, rolls back or is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bankcore_common::{AccountId, BankError, RequestId, Result};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    Account(AccountId),
    Request(RequestId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Account(id) => write!(f, "account:{}", id),
            LockKey::Request(id) => write!(f, "request:{}", id),
        }
    }
}

/// A held lock. Released on drop.
pub struct LockGuard {
    key: LockKey,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub fn key(&self) -> LockKey {
        self.key
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Lock counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    pub acquired: u64,
    pub contended: u64,
    pub timed_out: u64,
    pub tracked_keys: usize,
}

/// Manager for keyed locks.
pub struct LockManager {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
    timeout: Duration,
    acquired: AtomicU64,
    contended: AtomicU64,
    timed_out: AtomicU64,
}

impl LockManager {
    /// Create a lock manager that gives up on a key after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
            acquired: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// Acquire `key`, waiting at most the configured timeout.
    pub async fn acquire(&self, key: LockKey) -> Result<LockGuard> {
        // Clone the mutex out so the map shard is not held across the await.
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = match mutex.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Waiting for lock");
                match tokio::time::timeout(self.timeout, mutex.lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        self.timed_out.fetch_add(1, Ordering::Relaxed);
                        warn!(key = %key, timeout_ms = self.timeout.as_millis() as u64, "Lock timed out");
                        return Err(BankError::Storage(format!(
                            "Timed out waiting for lock on {}",
                            key
                        )));
                    }
                }
            }
        };

        self.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(LockGuard {
            key,
            _guard: guard,
        })
    }

    /// Check whether `key` is currently held.
    pub fn is_locked(&self, key: LockKey) -> bool {
        self.locks
            .get(&key)
            .map(|mutex| mutex.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop entries nobody holds or waits on. Returns how many were removed.
    pub fn cleanup_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }

    /// Run cleanup loop to prune idle keys.
    pub async fn run_cleanup_loop(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let removed = self.cleanup_idle();
            if removed > 0 {
                debug!(removed, "Pruned idle lock entries");
            }
        }
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            tracked_keys: self.locks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LockManager {
        LockManager::new(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let manager = manager();
        let key = LockKey::Account(AccountId::new(1));

        let guard = manager.acquire(key).await.unwrap();
        assert!(manager.is_locked(key));

        let err = manager.acquire(key).await.unwrap_err();
        assert_eq!(err.error_code(), "STORAGE_ERROR");
        assert!(err.is_retryable());

        drop(guard);
        assert!(!manager.is_locked(key));
        assert!(manager.acquire(key).await.is_ok());

        let stats = manager.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.contended, 1);
        assert_eq!(stats.timed_out, 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_conflict() {
        let manager = manager();
        let _account = manager
            .acquire(LockKey::Account(AccountId::new(1)))
            .await
            .unwrap();
        let _request = manager
            .acquire(LockKey::Request(RequestId::new(1)))
            .await
            .unwrap();
        let _other = manager
            .acquire(LockKey::Account(AccountId::new(2)))
            .await
            .unwrap();
        assert_eq!(manager.stats().contended, 0);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let manager = Arc::new(LockManager::new(Duration::from_secs(1)));
        let key = LockKey::Request(RequestId::new(4));
        let guard = manager.acquire(key).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(key).await.map(|g| g.key()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert_eq!(waiter.await.unwrap().unwrap(), key);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_held_keys() {
        let manager = manager();
        let held = manager
            .acquire(LockKey::Account(AccountId::new(1)))
            .await
            .unwrap();
        drop(
            manager
                .acquire(LockKey::Account(AccountId::new(2)))
                .await
                .unwrap(),
        );

        assert_eq!(manager.cleanup_idle(), 1);
        assert!(manager.is_locked(held.key()));
        assert_eq!(manager.stats().tracked_keys, 1);
    }
}
