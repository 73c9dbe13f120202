//! Postgres-backed lock store.
//!
//! Lock rows live in `distributed_locks`, keyed by `(owner, name)` (see
//! `migrations/0001_distributed_locks.sql`). Every transaction starts with
//! `SET TRANSACTION ISOLATION LEVEL SERIALIZABLE` so that two callers racing
//! on "row absent, insert" cannot both commit.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LockStoreError | Scenario |
//! |------------|----------------------|----------------|----------|
//! | Database (serialization failure) | `40001` | `Conflict` | Concurrent transaction on the same key |
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent insert of the same key |
//! | Database (other) | Any other | `Storage` | Constraint or SQL errors |
//! | PoolClosed / Io / Other | N/A | `Storage` | Connection failures |
//!
//! ## Threading
//!
//! The store is synchronous: each statement is driven with
//! [`tokio::runtime::Handle::block_on`] on the caller's thread. Call it from
//! plain threads (job threads, lock waiters). Threads that carry a runtime
//! context, `spawn_blocking` threads included, get `LockStoreError::Storage`.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use regards_core::LockOwner;

use super::store::{LockStore, LockStoreError, LockTx};
use super::types::{Lock, LockKey};

const SCHEMA: &str = include_str!("../../migrations/0001_distributed_locks.sql");

/// Postgres-backed lock store.
#[derive(Debug, Clone)]
pub struct PostgresLockStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresLockStore {
    /// Create a store over `pool`, driving queries on `runtime`.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Create the lock table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), LockStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Delete every lock row. Intended for test setup.
    pub async fn clear(&self) -> Result<u64, LockStoreError> {
        let result = sqlx::query("DELETE FROM distributed_locks")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear", e))?;
        Ok(result.rows_affected())
    }

    fn begin(&self) -> Result<Transaction<'static, Postgres>, LockStoreError> {
        self.runtime
            .block_on(async {
                let mut tx = self.pool.begin().await?;
                sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                    .execute(&mut *tx)
                    .await?;
                Ok::<_, sqlx::Error>(tx)
            })
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

impl LockStore for PostgresLockStore {
    fn in_serializable_tx<T, F>(&self, f: F) -> Result<T, LockStoreError>
    where
        F: FnOnce(&mut dyn LockTx) -> Result<T, LockStoreError>,
    {
        // `block_on` panics on runtime worker threads, and tokio offers no way
        // to tell those apart from `spawn_blocking` threads, so any thread
        // with a runtime context is refused, including `spawn_blocking`
        // closures. Drive the store from plain `std::thread`s instead.
        if Handle::try_current().is_ok() {
            return Err(LockStoreError::Storage(
                "blocking lock store called from within an async runtime".to_string(),
            ));
        }

        let mut pg_tx = PgLockTx {
            tx: self.begin()?,
            runtime: &self.runtime,
        };

        match f(&mut pg_tx) {
            Ok(out) => {
                self.runtime
                    .block_on(pg_tx.tx.commit())
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok(out)
            }
            Err(err) => {
                // Rollback failures are superseded by the original error.
                let _ = self.runtime.block_on(pg_tx.tx.rollback());
                Err(err)
            }
        }
    }
}

struct PgLockTx<'a> {
    tx: Transaction<'static, Postgres>,
    runtime: &'a Handle,
}

impl LockTx for PgLockTx<'_> {
    #[instrument(skip(self), fields(owner = %key.owner, name = %key.name), err)]
    fn find(&mut self, key: &LockKey) -> Result<Option<Lock>, LockStoreError> {
        let row = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT owner, name, expiration, created_at
                    FROM distributed_locks
                    WHERE owner = $1 AND name = $2
                    "#,
                )
                .bind(key.owner.as_str())
                .bind(&key.name)
                .fetch_optional(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("find_lock", e))?;

        match row {
            Some(row) => {
                let lock_row = LockRow::from_row(&row).map_err(|e| {
                    LockStoreError::Storage(format!("failed to deserialize lock row: {e}"))
                })?;
                Ok(Some(lock_row.try_into()?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, lock), fields(owner = %lock.owner, name = %lock.name), err)]
    fn insert(&mut self, lock: &Lock) -> Result<(), LockStoreError> {
        self.runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO distributed_locks (owner, name, expiration, created_at)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(lock.owner.as_str())
                .bind(&lock.name)
                .bind(lock.expiration)
                .bind(lock.created_at)
                .execute(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("insert_lock", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(owner = %key.owner, name = %key.name), err)]
    fn delete(&mut self, key: &LockKey) -> Result<bool, LockStoreError> {
        let result = self
            .runtime
            .block_on(
                sqlx::query("DELETE FROM distributed_locks WHERE owner = $1 AND name = $2")
                    .bind(key.owner.as_str())
                    .bind(&key.name)
                    .execute(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("delete_lock", e))?;
        Ok(result.rows_affected() > 0)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LockStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("23505") => LockStoreError::Conflict(msg),
                _ => LockStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            LockStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => LockStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct LockRow {
    owner: String,
    name: String,
    expiration: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for LockRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(LockRow {
            owner: row.try_get("owner")?,
            name: row.try_get("name")?,
            expiration: row.try_get("expiration")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<LockRow> for Lock {
    type Error = LockStoreError;

    fn try_from(row: LockRow) -> Result<Self, Self::Error> {
        let owner = LockOwner::new(row.owner)
            .map_err(|e| LockStoreError::Storage(format!("corrupt lock row: {e}")))?;
        Ok(Lock {
            name: row.name,
            owner,
            expiration: row.expiration,
            created_at: row.created_at,
        })
    }
}
