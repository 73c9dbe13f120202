//! Lock storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::types::{Lock, LockKey};

/// Operations available inside a lock-store transaction.
pub trait LockTx {
    /// Find the lock row for `key`.
    fn find(&mut self, key: &LockKey) -> Result<Option<Lock>, LockStoreError>;

    /// Insert a new lock row. Fails with `Conflict` when the key already exists.
    fn insert(&mut self, lock: &Lock) -> Result<(), LockStoreError>;

    /// Delete the lock row for `key`. Returns whether a row was removed.
    fn delete(&mut self, key: &LockKey) -> Result<bool, LockStoreError>;
}

/// Lock store abstraction.
///
/// All mutation of lock rows goes through [`LockStore::in_serializable_tx`]:
/// the closure runs in a new transaction at serializable isolation,
/// independent of any transaction the caller may hold. The transaction
/// commits when the closure returns `Ok` and rolls back otherwise.
pub trait LockStore: Send + Sync {
    fn in_serializable_tx<T, F>(&self, f: F) -> Result<T, LockStoreError>
    where
        F: FnOnce(&mut dyn LockTx) -> Result<T, LockStoreError>;

    /// Read a lock row.
    fn get(&self, key: &LockKey) -> Result<Option<Lock>, LockStoreError> {
        self.in_serializable_tx(|tx| tx.find(key))
    }
}

/// Lock store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockStoreError {
    /// A concurrent transaction touched the same key (serialization failure
    /// or duplicate key). The caller lost the race.
    #[error("lock contention: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<S: LockStore> LockStore for Arc<S> {
    fn in_serializable_tx<T, F>(&self, f: F) -> Result<T, LockStoreError>
    where
        F: FnOnce(&mut dyn LockTx) -> Result<T, LockStoreError>,
    {
        (**self).in_serializable_tx(f)
    }

    fn get(&self, key: &LockKey) -> Result<Option<Lock>, LockStoreError> {
        (**self).get(key)
    }
}

/// In-memory lock store for tests/dev and single-process deployments.
///
/// Transactions hold the store mutex for their whole duration and work on a
/// copy of the rows, which replaces the committed rows only on success.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    rows: Mutex<HashMap<LockKey, Lock>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of lock rows currently stored (expired ones included).
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a row directly, bypassing the lock service.
    pub fn put(&self, lock: Lock) -> Result<(), LockStoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| LockStoreError::Storage("lock store mutex poisoned".to_string()))?;
        rows.insert(lock.key(), lock);
        Ok(())
    }
}

struct InMemoryTx<'a> {
    rows: &'a mut HashMap<LockKey, Lock>,
}

impl LockTx for InMemoryTx<'_> {
    fn find(&mut self, key: &LockKey) -> Result<Option<Lock>, LockStoreError> {
        Ok(self.rows.get(key).cloned())
    }

    fn insert(&mut self, lock: &Lock) -> Result<(), LockStoreError> {
        let key = lock.key();
        if self.rows.contains_key(&key) {
            return Err(LockStoreError::Conflict(format!("lock {key} already exists")));
        }
        self.rows.insert(key, lock.clone());
        Ok(())
    }

    fn delete(&mut self, key: &LockKey) -> Result<bool, LockStoreError> {
        Ok(self.rows.remove(key).is_some())
    }
}

impl LockStore for InMemoryLockStore {
    fn in_serializable_tx<T, F>(&self, f: F) -> Result<T, LockStoreError>
    where
        F: FnOnce(&mut dyn LockTx) -> Result<T, LockStoreError>,
    {
        let mut committed = self
            .rows
            .lock()
            .map_err(|_| LockStoreError::Storage("lock store mutex poisoned".to_string()))?;

        let mut working = committed.clone();
        let out = f(&mut InMemoryTx { rows: &mut working })?;
        *committed = working;
        Ok(out)
    }
}
