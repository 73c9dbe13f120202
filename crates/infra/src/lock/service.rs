//! Lock service: obtain, wait for, release and run-with-lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use regards_core::{DomainError, LockOwner};

use super::cancel::CancelToken;
use super::store::{LockStore, LockStoreError};
use super::types::{Lock, LockKey};

/// Lock service error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// Caller input was rejected (blank name, non-positive expiration).
    #[error(transparent)]
    Validation(#[from] DomainError),
    /// The store failed; exclusivity cannot be guaranteed.
    #[error("lock storage error: {0}")]
    Storage(String),
}

enum Acquisition {
    Acquired,
    Evicted(Lock),
    Held,
}

/// Mutual exclusion for named critical sections shared between processes.
///
/// `Send + Sync`; correctness relies on the store's serializable transactions.
/// Waiting operations block the calling thread and must run on a dedicated
/// worker thread.
#[derive(Debug)]
pub struct LockService<S: LockStore> {
    store: S,
}

impl<S: LockStore> LockService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Try once to take the lock `(owner, name)`.
    ///
    /// Returns `true` when a new row was inserted. A live row, or losing a
    /// concurrent race for the key, returns `false`. An expired row is
    /// deleted and the call still returns `false`; the next call acquires.
    pub fn obtain_lock_or_skip(
        &self,
        name: &str,
        owner: &LockOwner,
        expires_in_seconds: u64,
    ) -> Result<bool, LockError> {
        validate_name(name)?;
        let now = Utc::now();
        let expires_in = validate_expiration(expires_in_seconds, now)?;
        let key = LockKey::new(owner.clone(), name);

        let outcome = self.store.in_serializable_tx(|tx| match tx.find(&key)? {
            None => {
                tx.insert(&Lock::new(&key, now, expires_in))?;
                Ok(Acquisition::Acquired)
            }
            Some(lock) if lock.is_expired_at(now) => {
                tx.delete(&key)?;
                Ok(Acquisition::Evicted(lock))
            }
            Some(_) => Ok(Acquisition::Held),
        });

        match outcome {
            Ok(Acquisition::Acquired) => {
                debug!(lock = %key, expires_in_seconds, "lock acquired");
                Ok(true)
            }
            Ok(Acquisition::Evicted(stale)) => {
                warn!(lock = %key, expired_at = ?stale.expiration, "stale lock evicted");
                Ok(false)
            }
            Ok(Acquisition::Held) => Ok(false),
            Err(LockStoreError::Conflict(msg)) => {
                debug!(lock = %key, reason = %msg, "lost race for lock");
                Ok(false)
            }
            Err(LockStoreError::Storage(msg)) => Err(LockError::Storage(msg)),
        }
    }

    /// Poll [`Self::obtain_lock_or_skip`] every `retry_interval` until it
    /// succeeds or `cancel` fires.
    ///
    /// Cancellation returns `Ok(false)` within one poll interval. Validation
    /// and storage errors end the wait and are returned.
    pub fn wait_for_lock(
        &self,
        name: &str,
        owner: &LockOwner,
        expires_in_seconds: u64,
        retry_interval: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, LockError> {
        loop {
            if cancel.is_cancelled() {
                info!(lock = %name, owner = %owner, "wait for lock cancelled");
                return Ok(false);
            }
            if self.obtain_lock_or_skip(name, owner, expires_in_seconds)? {
                return Ok(true);
            }
            if cancel.wait(retry_interval) {
                info!(lock = %name, owner = %owner, "wait for lock cancelled");
                return Ok(false);
            }
        }
    }

    /// Delete the lock `(owner, name)` if present. Releasing a missing lock is a no-op.
    pub fn release_lock(&self, name: &str, owner: &LockOwner) -> Result<(), LockError> {
        validate_name(name)?;
        let key = LockKey::new(owner.clone(), name);

        let removed = self
            .store
            .in_serializable_tx(|tx| tx.delete(&key))
            .map_err(|e| LockError::Storage(e.to_string()))?;

        if removed {
            debug!(lock = %key, "lock released");
        }
        Ok(())
    }

    /// Run `task` if the lock can be taken right now, then release it.
    ///
    /// Returns `None` without running the task when the lock is not obtained.
    /// If the task panics, or the release fails, the row stays until it
    /// expires; a failed release is logged and the task output still returned.
    pub fn try_run_with_lock<T>(
        &self,
        name: &str,
        owner: &LockOwner,
        expires_in_seconds: u64,
        task: impl FnOnce() -> T,
    ) -> Result<Option<T>, LockError> {
        if !self.obtain_lock_or_skip(name, owner, expires_in_seconds)? {
            debug!(lock = %name, owner = %owner, "lock busy, task skipped");
            return Ok(None);
        }
        let out = task();
        self.release_after_task(name, owner);
        Ok(Some(out))
    }

    /// Wait for the lock, run `task`, then release it.
    ///
    /// Returns `None` without running the task when the wait is cancelled.
    pub fn run_with_lock<T>(
        &self,
        name: &str,
        owner: &LockOwner,
        expires_in_seconds: u64,
        retry_interval: Duration,
        cancel: &CancelToken,
        task: impl FnOnce() -> T,
    ) -> Result<Option<T>, LockError> {
        if !self.wait_for_lock(name, owner, expires_in_seconds, retry_interval, cancel)? {
            return Ok(None);
        }
        let out = task();
        self.release_after_task(name, owner);
        Ok(Some(out))
    }

    fn release_after_task(&self, name: &str, owner: &LockOwner) {
        if let Err(e) = self.release_lock(name, owner) {
            error!(lock = %name, owner = %owner, error = %e, "failed to release lock after task, it is held until it expires");
        }
    }
}

fn validate_name(name: &str) -> Result<(), DomainError> {
    if name.trim().is_empty() {
        return Err(DomainError::validation("lock name must not be blank"));
    }
    Ok(())
}

fn validate_expiration(
    expires_in_seconds: u64,
    now: DateTime<Utc>,
) -> Result<chrono::Duration, DomainError> {
    if expires_in_seconds < 1 {
        return Err(DomainError::validation(
            "lock expiration must be at least one second",
        ));
    }
    i64::try_from(expires_in_seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .filter(|d| now.checked_add_signed(*d).is_some())
        .ok_or_else(|| {
            DomainError::validation(format!(
                "lock expiration of {expires_in_seconds}s is out of range"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Instant;

    use crate::lock::cancel::cancellation;
    use crate::lock::store::{InMemoryLockStore, LockTx};

    fn owner() -> LockOwner {
        LockOwner::new("JobService").unwrap()
    }

    fn service() -> LockService<Arc<InMemoryLockStore>> {
        LockService::new(InMemoryLockStore::arc())
    }

    fn stale_lock(name: &str) -> Lock {
        let key = LockKey::new(owner(), name);
        Lock::new(
            &key,
            Utc::now() - chrono::Duration::seconds(10),
            chrono::Duration::seconds(1),
        )
    }

    #[test]
    fn obtain_then_held() {
        let locks = service();

        assert!(locks.obtain_lock_or_skip("JOB_1", &owner(), 60).unwrap());
        assert!(!locks.obtain_lock_or_skip("JOB_1", &owner(), 60).unwrap());
        assert_eq!(locks.store().len(), 1);
    }

    #[test]
    fn other_owner_does_not_conflict() {
        let locks = service();
        let other = LockOwner::new("OrderService").unwrap();

        assert!(locks.obtain_lock_or_skip("JOB_1", &owner(), 60).unwrap());
        assert!(locks.obtain_lock_or_skip("JOB_1", &other, 60).unwrap());
    }

    #[test]
    fn expired_lock_is_evicted_then_reacquired() {
        let locks = service();
        locks.store().put(stale_lock("JOB_1")).unwrap();

        assert!(!locks.obtain_lock_or_skip("JOB_1", &owner(), 60).unwrap());
        assert!(locks.store().is_empty(), "stale row is deleted");
        assert!(locks.obtain_lock_or_skip("JOB_1", &owner(), 60).unwrap());
    }

    #[test]
    fn release_is_idempotent() {
        let locks = service();

        locks.release_lock("missing", &owner()).unwrap();
        assert!(locks.store().is_empty());

        assert!(locks.obtain_lock_or_skip("JOB_1", &owner(), 60).unwrap());
        locks.release_lock("JOB_1", &owner()).unwrap();
        locks.release_lock("JOB_1", &owner()).unwrap();
        assert!(locks.obtain_lock_or_skip("JOB_1", &owner(), 60).unwrap());
    }

    #[test]
    fn invalid_input_is_rejected() {
        let locks = service();

        assert!(matches!(
            locks.obtain_lock_or_skip("  ", &owner(), 60),
            Err(LockError::Validation(_))
        ));
        assert!(matches!(
            locks.obtain_lock_or_skip("JOB_1", &owner(), 0),
            Err(LockError::Validation(_))
        ));
        assert!(matches!(
            locks.obtain_lock_or_skip("JOB_1", &owner(), u64::MAX),
            Err(LockError::Validation(_))
        ));
        assert!(matches!(
            locks.release_lock("", &owner()),
            Err(LockError::Validation(_))
        ));
        assert!(locks.store().is_empty());
    }

    #[test]
    fn concurrent_callers_get_exactly_one_lock() {
        let locks = Arc::new(service());
        let callers = 8;
        let barrier = Arc::new(Barrier::new(callers));

        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    locks.obtain_lock_or_skip("JOB_1", &owner(), 60).unwrap()
                })
            })
            .collect();

        let acquired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(acquired, 1);
    }

    #[test]
    fn wait_for_lock_acquires_once_released() {
        let locks = Arc::new(service());
        assert!(locks.obtain_lock_or_skip("JOB_1", &owner(), 60).unwrap());

        let releaser = {
            let locks = locks.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                locks.release_lock("JOB_1", &owner()).unwrap();
            })
        };

        let (_canceller, token) = cancellation();
        let acquired = locks
            .wait_for_lock("JOB_1", &owner(), 60, Duration::from_millis(10), &token)
            .unwrap();
        releaser.join().unwrap();
        assert!(acquired);
    }

    #[test]
    fn wait_for_lock_returns_false_when_cancelled() {
        let locks = Arc::new(service());
        assert!(locks.obtain_lock_or_skip("JOB_1", &owner(), 3600).unwrap());

        let poll = Duration::from_millis(200);
        let (canceller, token) = cancellation();
        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || {
                let acquired = locks
                    .wait_for_lock("JOB_1", &owner(), 60, poll, &token)
                    .unwrap();
                (acquired, Instant::now())
            })
        };

        thread::sleep(Duration::from_millis(50));
        let cancelled_at = Instant::now();
        canceller.cancel();

        let (acquired, returned_at) = waiter.join().unwrap();
        assert!(!acquired);
        assert!(returned_at.duration_since(cancelled_at) <= poll);
    }

    #[test]
    fn try_run_with_lock_runs_and_releases() {
        let locks = service();

        let out = locks
            .try_run_with_lock("JOB_1", &owner(), 60, || 42)
            .unwrap();
        assert_eq!(out, Some(42));
        assert!(locks.store().is_empty());
    }

    #[test]
    fn try_run_with_lock_skips_when_held() {
        let locks = service();
        assert!(locks.obtain_lock_or_skip("JOB_1", &owner(), 60).unwrap());

        let mut ran = false;
        let out = locks
            .try_run_with_lock("JOB_1", &owner(), 60, || ran = true)
            .unwrap();
        assert_eq!(out, None);
        assert!(!ran);
        assert_eq!(locks.store().len(), 1);
    }

    #[test]
    fn run_with_lock_returns_none_when_cancelled() {
        let locks = service();
        assert!(locks.obtain_lock_or_skip("JOB_1", &owner(), 3600).unwrap());

        let (canceller, token) = cancellation();
        canceller.cancel();
        let out = locks
            .run_with_lock("JOB_1", &owner(), 60, Duration::from_millis(10), &token, || 1)
            .unwrap();
        assert_eq!(out, None);
    }

    struct FailingStore;

    impl LockStore for FailingStore {
        fn in_serializable_tx<T, F>(&self, _f: F) -> Result<T, LockStoreError>
        where
            F: FnOnce(&mut dyn LockTx) -> Result<T, LockStoreError>,
        {
            Err(LockStoreError::Storage("connection refused".to_string()))
        }
    }

    #[test]
    fn storage_failures_propagate() {
        let locks = LockService::new(FailingStore);

        assert_eq!(
            locks.obtain_lock_or_skip("JOB_1", &owner(), 60),
            Err(LockError::Storage("connection refused".to_string()))
        );
        assert!(matches!(
            locks.wait_for_lock("JOB_1", &owner(), 60, Duration::from_millis(1), &CancelToken::never()),
            Err(LockError::Storage(_))
        ));
        assert!(matches!(
            locks.release_lock("JOB_1", &owner()),
            Err(LockError::Storage(_))
        ));
    }

    /// Commits everything except deletes.
    struct ReleaseFailingStore(InMemoryLockStore);

    struct NoDeleteTx<'a> {
        inner: &'a mut dyn LockTx,
    }

    impl LockTx for NoDeleteTx<'_> {
        fn find(&mut self, key: &LockKey) -> Result<Option<Lock>, LockStoreError> {
            self.inner.find(key)
        }

        fn insert(&mut self, lock: &Lock) -> Result<(), LockStoreError> {
            self.inner.insert(lock)
        }

        fn delete(&mut self, _key: &LockKey) -> Result<bool, LockStoreError> {
            Err(LockStoreError::Storage("connection reset".to_string()))
        }
    }

    impl LockStore for ReleaseFailingStore {
        fn in_serializable_tx<T, F>(&self, f: F) -> Result<T, LockStoreError>
        where
            F: FnOnce(&mut dyn LockTx) -> Result<T, LockStoreError>,
        {
            self.0.in_serializable_tx(|tx| f(&mut NoDeleteTx { inner: tx }))
        }
    }

    #[test]
    fn task_output_survives_a_failed_release() {
        let locks = LockService::new(ReleaseFailingStore(InMemoryLockStore::new()));

        let out = locks.try_run_with_lock("JOB_1", &owner(), 60, || "done");
        assert_eq!(out, Ok(Some("done")));

        let out = locks.run_with_lock(
            "JOB_2",
            &owner(),
            60,
            Duration::from_millis(1),
            &CancelToken::never(),
            || 7,
        );
        assert_eq!(out, Ok(Some(7)));

        // The rows outlive the failed releases until they expire.
        assert_eq!(locks.store().0.len(), 2);
    }

    struct ContendedStore;

    impl LockStore for ContendedStore {
        fn in_serializable_tx<T, F>(&self, _f: F) -> Result<T, LockStoreError>
        where
            F: FnOnce(&mut dyn LockTx) -> Result<T, LockStoreError>,
        {
            Err(LockStoreError::Conflict("could not serialize access".to_string()))
        }
    }

    #[test]
    fn serialization_conflict_means_not_acquired() {
        let locks = LockService::new(ContendedStore);
        assert_eq!(locks.obtain_lock_or_skip("JOB_1", &owner(), 60), Ok(false));
    }
}
