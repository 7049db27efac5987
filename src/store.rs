//! The storage handle shared by the dispatcher and every handler.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::capability::ThreadSafetySource;
use crate::config::Config;
use crate::db;
use crate::error::IndexerError;
use crate::upsert::{Entity, Statement, UpsertCoordinator};

/// Pool plus the insert lock that serializes locked upserts.
///
/// Cloning is cheap and every clone shares the pool and the lock.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    insert_lock: Arc<Mutex<()>>,
    thread_safety: Option<u8>,
}

impl Store {
    pub fn new(pool: SqlitePool, insert_lock: Arc<Mutex<()>>) -> Self {
        Self {
            pool,
            insert_lock,
            thread_safety: None,
        }
    }

    /// Connect to `<db.dir>` with `schemas` attached.
    pub async fn open(config: &Config, schemas: &[String]) -> Result<Self> {
        let pool = db::connect(config, schemas)
            .await
            .with_context(|| format!("Failed to open database in {}", config.db.dir.display()))?;
        Ok(Self::new(pool, Arc::new(Mutex::new(()))).with_thread_safety(config.db.thread_safety))
    }

    /// Overrides the level reported by the driver.
    pub fn with_thread_safety(mut self, level: Option<u8>) -> Self {
        self.thread_safety = level;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn insert_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.insert_lock)
    }

    pub fn upserts(&self) -> UpsertCoordinator {
        UpsertCoordinator::new(self.pool.clone(), Arc::clone(&self.insert_lock))
    }

    /// See [`UpsertCoordinator::get_or_create`].
    pub async fn get_or_create(
        &self,
        lookup: &Statement,
        insert: &Statement,
        allow_parallel_insert: bool,
    ) -> Result<Entity, IndexerError> {
        self.upserts()
            .get_or_create(lookup, insert, allow_parallel_insert)
            .await
    }

    pub async fn fetch_optional(&self, statement: &Statement) -> Result<Option<Entity>, IndexerError> {
        self.upserts().lookup(statement).await
    }

    /// Run a statement that returns no rows; yields the affected row count.
    pub async fn execute(&self, statement: &Statement) -> Result<u64, IndexerError> {
        let done = statement
            .query()
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, statement.insert_target()))?;
        Ok(done.rows_affected())
    }

    /// `SELECT 1` through the pool.
    pub async fn health_check(&self) -> Result<(), IndexerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, ""))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ThreadSafetySource for Store {
    /// SQLite's compile-time `THREADSAFE` setting mapped onto the ordinal:
    /// `0 → 0`, multi-thread `2 → 1`, serialized `1 → 3`.
    async fn thread_safety(&self) -> Result<u8> {
        if let Some(level) = self.thread_safety {
            return Ok(level);
        }
        let options: Vec<String> = sqlx::query_scalar("PRAGMA compile_options")
            .fetch_all(&self.pool)
            .await
            .context("Failed to read compile options")?;
        let mode = options
            .iter()
            .find_map(|o| o.strip_prefix("THREADSAFE="))
            .context("THREADSAFE compile option not reported")?;
        match mode.trim() {
            "0" => Ok(0),
            "2" => Ok(1),
            "1" => Ok(3),
            other => anyhow::bail!("unrecognized THREADSAFE mode '{}'", other),
        }
    }
}

/// Map a driver error onto the indexer taxonomy.
///
/// Connection-class failures make the store unusable; unique violations are
/// upsert conflicts on `table`; everything else is a statement failure.
pub fn classify(err: sqlx::Error, table: &str) -> IndexerError {
    if is_store_unavailable(&err) {
        return IndexerError::StoreUnavailable(err.to_string());
    }
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => IndexerError::UpsertConflict {
            table: table.to_string(),
            message: db.message().to_string(),
        },
        _ => IndexerError::Database(err.to_string()),
    }
}

/// Whether `err` leaves the pool or the database file unusable.
pub fn is_store_unavailable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolClosed
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => is_unusable_code(db.code().as_deref()),
        _ => false,
    }
}

/// Primary result codes for I/O errors, corruption, failure to open, and
/// not-a-database.
fn is_unusable_code(code: Option<&str>) -> bool {
    let Some(code) = code.and_then(|c| c.parse::<i32>().ok()) else {
        return false;
    };
    matches!(code & 0xff, 10 | 11 | 14 | 26)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::supports_parallel_connections;

    async fn memory_store() -> Store {
        let pool = db::connect_memory(&[]).await.unwrap();
        Store::new(pool, Arc::new(Mutex::new(())))
    }

    #[tokio::test]
    async fn reads_threadsafe_compile_option() {
        let store = memory_store().await;
        let level = store.thread_safety().await.unwrap();
        assert!(level <= 3);
    }

    #[tokio::test]
    async fn override_wins() {
        let store = memory_store().await.with_thread_safety(Some(1));
        assert_eq!(store.thread_safety().await.unwrap(), 1);
        assert!(!supports_parallel_connections(&store).await);
    }

    #[tokio::test]
    async fn closed_pool_is_unavailable() {
        let store = memory_store().await;
        store.health_check().await.unwrap();
        store.close().await;
        let err = store.health_check().await.unwrap_err();
        assert!(err.is_fatal(), "{err:?}");
    }

    #[test]
    fn unusable_codes() {
        assert!(is_unusable_code(Some("10")));
        assert!(is_unusable_code(Some("266")));
        assert!(is_unusable_code(Some("14")));
        assert!(!is_unusable_code(Some("2067")));
        assert!(!is_unusable_code(None));
    }

    #[tokio::test]
    async fn execute_reports_rows() {
        let store = memory_store().await;
        store
            .execute(&Statement::new("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)"))
            .await
            .unwrap();
        let n = store
            .execute(&Statement::new("INSERT INTO t (v) VALUES (?), (?)").bind("a").bind("b"))
            .await
            .unwrap();
        assert_eq!(n, 2);
    }
}
