//! Distributed lock service backed by a transactional store.
//!
//! ## Design
//!
//! - A lock is a row keyed by `(owner, name)`; row presence is the lock signal
//! - Check-and-insert runs in a new serializable transaction supplied by the store
//! - Expired rows are evicted by the next caller, which still reports `false`;
//!   the following call acquires (two-phase reclamation)
//! - Waiting is cooperative: a [`CancelToken`] ends the poll loop
//!
//! ## Components
//!
//! - `Lock`: a lock row
//! - `LockStore`: transactional persistence (in-memory or Postgres)
//! - `LockService`: obtain / wait / release / run-with-lock operations

pub mod cancel;
pub mod postgres;
pub mod service;
pub mod store;
pub mod types;

pub use cancel::{CancelToken, Canceller, cancellation};
pub use postgres::PostgresLockStore;
pub use service::{LockError, LockService};
pub use store::{InMemoryLockStore, LockStore, LockStoreError, LockTx};
pub use types::{Lock, LockKey};
