//! Lock row types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use regards_core::LockOwner;

/// Unique key of a lock row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub owner: LockOwner,
    pub name: String,
}

impl LockKey {
    pub fn new(owner: LockOwner, name: impl Into<String>) -> Self {
        Self {
            owner,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A named mutual-exclusion claim held by a logical component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub name: String,
    pub owner: LockOwner,
    /// After this instant the lock is stale and may be evicted. `None` never expires.
    pub expiration: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Lock {
    /// Create a lock expiring `expires_in` after `now`.
    pub fn new(key: &LockKey, now: DateTime<Utc>, expires_in: Duration) -> Self {
        Self {
            name: key.name.clone(),
            owner: key.owner.clone(),
            expiration: Some(now + expires_in),
            created_at: now,
        }
    }

    pub fn key(&self) -> LockKey {
        LockKey::new(self.owner.clone(), self.name.clone())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|at| at < now)
    }
}
