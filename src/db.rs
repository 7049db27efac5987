use anyhow::{bail, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

/// Open the index database and attach one database file per handler schema.
///
/// `<dir>/index.db` is the main database; every schema in `schemas` is
/// attached as `"<schema>"` from `<dir>/<schema>.db` on every pooled
/// connection.
pub async fn connect(config: &Config, schemas: &[String]) -> Result<SqlitePool> {
    let dir = &config.db.dir;
    std::fs::create_dir_all(dir)?;

    let mut attachments = Vec::with_capacity(schemas.len());
    for schema in schemas {
        validate_schema_name(schema)?;
        attachments.push((schema.clone(), dir.join(format!("{}.db", schema))));
    }

    let options = SqliteConnectOptions::new()
        .filename(dir.join("index.db"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));

    open_pool(options, config.db.max_connections, attachments, true).await
}

/// A private in-memory database with in-memory schemas, on one connection.
pub async fn connect_memory(schemas: &[String]) -> Result<SqlitePool> {
    let mut attachments = Vec::with_capacity(schemas.len());
    for schema in schemas {
        validate_schema_name(schema)?;
        attachments.push((schema.clone(), PathBuf::from(":memory:")));
    }

    let options = SqliteConnectOptions::new().in_memory(true);
    open_pool(options, 1, attachments, false).await
}

async fn open_pool(
    options: SqliteConnectOptions,
    max_connections: u32,
    attachments: Vec<(String, PathBuf)>,
    wal: bool,
) -> Result<SqlitePool> {
    let attachments = Arc::new(attachments);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .after_connect(move |conn, _meta| {
            let attachments = Arc::clone(&attachments);
            Box::pin(async move {
                for (schema, path) in attachments.iter() {
                    sqlx::query(&format!("ATTACH DATABASE ? AS \"{}\"", schema))
                        .bind(path.to_string_lossy().to_string())
                        .execute(&mut *conn)
                        .await?;
                    if wal {
                        sqlx::query(&format!("PRAGMA \"{}\".journal_mode = WAL", schema))
                            .execute(&mut *conn)
                            .await?;
                    }
                }
                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Schema names become SQL identifiers and file names.
pub fn validate_schema_name(schema: &str) -> Result<()> {
    let valid = !schema.is_empty()
        && schema != "main"
        && schema != "temp"
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !schema.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        bail!(
            "Invalid schema name '{}': use letters, digits and '_' (not 'main' or 'temp')",
            schema
        );
    }
    Ok(())
}
