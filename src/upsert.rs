//! Idempotent get-or-create for rows keyed by a natural uniqueness constraint.
//!
//! Reference tables (mime strings, paths, meta names) are contended by many
//! concurrent handler invocations. The read path is never serialized; only a
//! lookup miss on a locked upsert enters the shared insert lock, re-checks,
//! and inserts. Callers choose per call whether an insert may skip the lock,
//! in which case the table's uniqueness constraint is the final arbiter and a
//! violation surfaces as [`IndexerError::UpsertConflict`].

use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::IndexerError;
use crate::store::classify;

/// A bindable SQLite value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// SQL text plus its bind values; re-executable any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    binds: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.binds.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn binds(&self) -> &[SqlValue] {
        &self.binds
    }

    /// Target table of an `INSERT INTO <table>` statement, for error reports.
    pub fn insert_target(&self) -> &str {
        let upper = self.sql.trim_start().to_ascii_uppercase();
        let trimmed = self.sql.trim_start();
        match upper.find("INTO ") {
            Some(pos) => trimmed[pos + 5..]
                .trim_start()
                .split(|c: char| c.is_whitespace() || c == '(')
                .next()
                .unwrap_or(""),
            None => "",
        }
    }

    pub(crate) fn query(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        let mut query = sqlx::query(&self.sql);
        for value in &self.binds {
            query = match value {
                SqlValue::Null => query.bind(None::<i64>),
                SqlValue::Integer(v) => query.bind(*v),
                SqlValue::Real(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.as_str()),
            };
        }
        query
    }
}

/// One row, as ordered `(column, value)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    columns: Vec<(String, SqlValue)>,
}

impl Entity {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        match self.get(column)? {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// The `id` column.
    pub fn id(&self) -> Result<i64, IndexerError> {
        self.get_i64("id")
            .ok_or_else(|| IndexerError::Database("row has no integer id column".to_string()))
    }

    pub fn columns(&self) -> &[(String, SqlValue)] {
        &self.columns
    }

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let mut columns = Vec::with_capacity(row.columns().len());
        for column in row.columns() {
            let i = column.ordinal();
            let raw = row.try_get_raw(i)?;
            let value = if raw.is_null() {
                SqlValue::Null
            } else {
                match raw.type_info().name() {
                    "INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get::<i64, _>(i)?),
                    "REAL" | "NUMERIC" => SqlValue::Real(row.try_get::<f64, _>(i)?),
                    "BLOB" => SqlValue::Text(
                        String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(i)?).into_owned(),
                    ),
                    _ => SqlValue::Text(row.try_get::<String, _>(i)?),
                }
            };
            columns.push((column.name().to_string(), value));
        }
        Ok(Self { columns })
    }
}

/// Get-or-create over a pool, sharing one insert lock across callers.
#[derive(Clone)]
pub struct UpsertCoordinator {
    pool: SqlitePool,
    lock: Arc<Mutex<()>>,
}

impl UpsertCoordinator {
    /// `lock` is shared by every coordinator that must serialize inserts.
    pub fn new(pool: SqlitePool, lock: Arc<Mutex<()>>) -> Self {
        Self { pool, lock }
    }

    /// Return the row matched by `lookup`, inserting it with `insert` if absent.
    ///
    /// With `allow_parallel_insert = false` the insert runs under the shared
    /// lock after a second lookup. With `true` the insert runs directly and a
    /// uniqueness violation is returned as [`IndexerError::UpsertConflict`].
    /// `insert` may end in `RETURNING *`; otherwise the lookup is re-run.
    pub async fn get_or_create(
        &self,
        lookup: &Statement,
        insert: &Statement,
        allow_parallel_insert: bool,
    ) -> Result<Entity, IndexerError> {
        if let Some(found) = self.lookup(lookup).await? {
            return Ok(found);
        }

        if allow_parallel_insert {
            return self.insert(lookup, insert).await;
        }

        let _guard = self.lock.lock().await;
        if let Some(found) = self.lookup(lookup).await? {
            tracing::trace!(table = insert.insert_target(), "inserted by a concurrent caller");
            return Ok(found);
        }
        self.insert(lookup, insert).await
    }

    pub async fn lookup(&self, lookup: &Statement) -> Result<Option<Entity>, IndexerError> {
        let row = lookup
            .query()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, ""))?;
        row.as_ref()
            .map(Entity::from_row)
            .transpose()
            .map_err(|e| classify(e, ""))
    }

    async fn insert(&self, lookup: &Statement, insert: &Statement) -> Result<Entity, IndexerError> {
        let table = insert.insert_target();
        tracing::debug!(table, "no entity found, inserting");

        let returned = insert
            .query()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, table))?;

        if let Some(row) = returned {
            return Entity::from_row(&row).map_err(|e| classify(e, table));
        }

        self.lookup(lookup).await?.ok_or_else(|| {
            IndexerError::Database(format!("row not found after insert into {}", table))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn setup() -> UpsertCoordinator {
        let pool = db::connect_memory(&["core".to_string()]).await.unwrap();
        sqlx::query(
            "CREATE TABLE \"core\".\"file_mime\" (id INTEGER PRIMARY KEY AUTOINCREMENT, mime TEXT NOT NULL UNIQUE)",
        )
        .execute(&pool)
        .await
        .unwrap();
        UpsertCoordinator::new(pool, Arc::new(Mutex::new(())))
    }

    fn lookup(mime: &str) -> Statement {
        Statement::new("SELECT * FROM \"core\".\"file_mime\" WHERE mime = ?").bind(mime)
    }

    fn insert(mime: &str) -> Statement {
        Statement::new("INSERT INTO \"core\".\"file_mime\" (mime) VALUES (?)").bind(mime)
    }

    #[test]
    fn insert_target_is_parsed() {
        assert_eq!(insert("x").insert_target(), "\"core\".\"file_mime\"");
        assert_eq!(
            Statement::new("insert into t(a) values (1)").insert_target(),
            "t"
        );
        assert_eq!(Statement::new("SELECT 1").insert_target(), "");
    }

    #[tokio::test]
    async fn creates_once_then_returns_existing() {
        let upserts = setup().await;
        let first = upserts
            .get_or_create(&lookup("audio/mpeg"), &insert("audio/mpeg"), false)
            .await
            .unwrap();
        let second = upserts
            .get_or_create(&lookup("audio/mpeg"), &insert("audio/mpeg"), false)
            .await
            .unwrap();
        assert_eq!(first.id().unwrap(), second.id().unwrap());
        assert_eq!(first.get_str("mime"), Some("audio/mpeg"));
    }

    #[tokio::test]
    async fn returning_clause_is_used_when_present() {
        let upserts = setup().await;
        let insert = Statement::new(
            "INSERT INTO \"core\".\"file_mime\" (mime) VALUES (?) RETURNING *",
        )
        .bind("text/plain");
        let entity = upserts
            .get_or_create(&lookup("text/plain"), &insert, true)
            .await
            .unwrap();
        assert_eq!(entity.get_str("mime"), Some("text/plain"));
        assert!(entity.id().is_ok());
    }

    #[tokio::test]
    async fn parallel_insert_conflict_propagates() {
        let upserts = setup().await;
        upserts
            .get_or_create(&lookup("a/b"), &insert("a/b"), true)
            .await
            .unwrap();
        // A lookup that never matches forces a second insert of the same key.
        let never = Statement::new("SELECT * FROM \"core\".\"file_mime\" WHERE 0");
        let err = upserts
            .get_or_create(&never, &insert("a/b"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::UpsertConflict { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn null_and_real_values_round_trip() {
        let upserts = setup().await;
        let row = upserts
            .lookup(&Statement::new("SELECT NULL AS a, 1.5 AS b, 'x' AS c, 7 AS d"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("a"), Some(&SqlValue::Null));
        assert_eq!(row.get("b"), Some(&SqlValue::Real(1.5)));
        assert_eq!(row.get_str("c"), Some("x"));
        assert_eq!(row.get_i64("d"), Some(7));
    }
}
