//! The core handler: one row per file, plus shared mime, encoding and path
//! reference rows. Every other handler depends on it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::Read;

use crate::config::Config;
use crate::handlers::timestamp;
use crate::models::FileDescriptor;
use crate::schema::{SchemaBuilder, TableRef};
use crate::store::Store;
use crate::traits::HandlerPlugin;
use crate::upsert::{Entity, Statement};

const SCHEMA: &str = "core";

/// Indexes every file: mime, encoding, location, size, modification time,
/// description and SHA-256 hash.
pub struct CoreHandler;

impl CoreHandler {
    pub const NAME: &'static str = "file_indexer::handlers::core::CoreHandler";
}

/// A table of the `core` schema.
pub fn table(name: &str) -> TableRef {
    TableRef::new(SCHEMA, name)
}

#[async_trait]
impl HandlerPlugin for CoreHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn handled_mime_patterns(&self) -> Vec<String> {
        vec!["*".to_string()]
    }

    fn database_schema(&self) -> &str {
        SCHEMA
    }

    fn define_tables(&self, schema: &mut SchemaBuilder) {
        schema.table("file_mime", &["mime TEXT NOT NULL UNIQUE"]);
        schema.table("file_encoding", &["encoding TEXT NOT NULL UNIQUE"]);
        let path = schema.table(
            "file_path",
            &[
                "path TEXT NOT NULL",
                "scheme_host TEXT NOT NULL",
                "UNIQUE (path, scheme_host)",
            ],
        );
        let file = schema.table(
            "file",
            &[
                "id_file_mime INTEGER NOT NULL REFERENCES file_mime(id) ON DELETE CASCADE",
                "id_file_encoding INTEGER NOT NULL REFERENCES file_encoding(id) ON DELETE CASCADE",
                "id_file_path INTEGER NOT NULL REFERENCES file_path(id) ON DELETE CASCADE",
                "filename TEXT NOT NULL",
                "size_kilobyte INTEGER NOT NULL",
                "last_update TEXT",
                "file_description TEXT",
                "hash TEXT",
                "UNIQUE (id_file_path, filename)",
            ],
        );
        schema.index(&path, &["scheme_host"]);
        schema.index(&file, &["filename"]);
        schema.index(&file, &["last_update"]);
        schema.index(&file, &["hash"]);
    }

    async fn handle(&self, file: &FileDescriptor, store: &Store, _config: &Config) -> Result<()> {
        match find_file(store, file).await? {
            Some(existing) if !is_stale(&existing, file) => {
                tracing::trace!(path = %file.full_path().display(), "unchanged");
                Ok(())
            }
            Some(existing) => refresh_file(store, file, existing.id()?).await,
            None => file_entity(store, file).await.map(|_| ()),
        }
    }
}

/// The `core.file` row for `file`, if it has been indexed.
pub async fn find_file(store: &Store, file: &FileDescriptor) -> Result<Option<Entity>> {
    let lookup = Statement::new(format!(
        "SELECT f.* FROM {} AS f JOIN {} AS p ON f.id_file_path = p.id \
         WHERE f.filename = ? AND p.path = ? AND p.scheme_host = ?",
        table("file").qualified(),
        table("file_path").qualified()
    ))
    .bind(file.file_name())
    .bind(parent_path(file))
    .bind(file.scheme_and_host());
    Ok(store.fetch_optional(&lookup).await?)
}

/// Whether `file` changed since it was last indexed. Unindexed files count
/// as modified.
pub async fn have_been_modified(store: &Store, file: &FileDescriptor) -> Result<bool> {
    Ok(match find_file(store, file).await? {
        Some(existing) => is_stale(&existing, file),
        None => true,
    })
}

fn is_stale(existing: &Entity, file: &FileDescriptor) -> bool {
    existing.get_str("last_update") != file.modified().map(timestamp).as_deref()
}

/// Get or create the `core.file` row for `file`, with its reference rows.
///
/// Dependent handlers call this to obtain the file id they link to.
pub async fn file_entity(store: &Store, file: &FileDescriptor) -> Result<Entity> {
    let mime_id = mime_entity(store, file.mime()).await?.id()?;
    let encoding_id = encoding_entity(store, file.encoding()).await?.id()?;
    let path_id = path_entity(store, &parent_path(file), file.scheme_and_host())
        .await?
        .id()?;

    let file_table = table("file").qualified();
    let lookup = Statement::new(format!(
        "SELECT * FROM {} WHERE id_file_path = ? AND filename = ?",
        file_table
    ))
    .bind(path_id)
    .bind(file.file_name());

    if let Some(found) = store.fetch_optional(&lookup).await? {
        return Ok(found);
    }

    let hash = hash_file(file).await?;
    let insert = Statement::new(format!(
        "INSERT INTO {} (id_file_mime, id_file_encoding, id_file_path, filename, \
         size_kilobyte, last_update, file_description, hash) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
        file_table
    ))
    .bind(mime_id)
    .bind(encoding_id)
    .bind(path_id)
    .bind(file.file_name())
    .bind(file.size_kb())
    .bind(file.modified().map(timestamp))
    .bind(file.description())
    .bind(hash);

    Ok(store.get_or_create(&lookup, &insert, true).await?)
}

async fn refresh_file(store: &Store, file: &FileDescriptor, id: i64) -> Result<()> {
    let mime_id = mime_entity(store, file.mime()).await?.id()?;
    let encoding_id = encoding_entity(store, file.encoding()).await?.id()?;
    let hash = hash_file(file).await?;
    let update = Statement::new(format!(
        "UPDATE {} SET id_file_mime = ?, id_file_encoding = ?, size_kilobyte = ?, \
         last_update = ?, file_description = ?, hash = ? WHERE id = ?",
        table("file").qualified()
    ))
    .bind(mime_id)
    .bind(encoding_id)
    .bind(file.size_kb())
    .bind(file.modified().map(timestamp))
    .bind(file.description())
    .bind(hash)
    .bind(id);
    store.execute(&update).await?;
    tracing::debug!(path = %file.full_path().display(), "refreshed");
    Ok(())
}

async fn mime_entity(store: &Store, mime: &str) -> Result<Entity> {
    let t = table("file_mime").qualified();
    let lookup = Statement::new(format!("SELECT * FROM {} WHERE mime = ?", t)).bind(mime);
    let insert = Statement::new(format!("INSERT INTO {} (mime) VALUES (?)", t)).bind(mime);
    Ok(store.get_or_create(&lookup, &insert, false).await?)
}

async fn encoding_entity(store: &Store, encoding: &str) -> Result<Entity> {
    let t = table("file_encoding").qualified();
    let lookup =
        Statement::new(format!("SELECT * FROM {} WHERE encoding = ?", t)).bind(encoding);
    let insert =
        Statement::new(format!("INSERT INTO {} (encoding) VALUES (?)", t)).bind(encoding);
    Ok(store.get_or_create(&lookup, &insert, false).await?)
}

async fn path_entity(store: &Store, path: &str, scheme_host: &str) -> Result<Entity> {
    let t = table("file_path").qualified();
    let lookup = Statement::new(format!(
        "SELECT * FROM {} WHERE path = ? AND scheme_host = ?",
        t
    ))
    .bind(path)
    .bind(scheme_host);
    let insert = Statement::new(format!(
        "INSERT INTO {} (path, scheme_host) VALUES (?, ?)",
        t
    ))
    .bind(path)
    .bind(scheme_host);
    Ok(store.get_or_create(&lookup, &insert, false).await?)
}

fn parent_path(file: &FileDescriptor) -> String {
    file.parent_path().to_string_lossy().into_owned()
}

/// Hex SHA-256 of the file contents.
async fn hash_file(file: &FileDescriptor) -> Result<String> {
    let file = file.clone();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut reader = file
            .open()
            .with_context(|| format!("Failed to open {}", file.full_path().display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await?
}
