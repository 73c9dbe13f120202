//! Infrastructure layer: distributed locks, job pulling, tenant roster, config.

pub mod config;
pub mod jobs;
pub mod lock;
pub mod tenants;


pub use config::{ConfigError, SchedulerConfig};
pub use lock::{InMemoryLockStore, LockError, LockService, LockStore, PostgresLockStore};
pub use tenants::{StaticTenantResolver, TenantResolver};
