//! Document summaries: page, word and character counts, table of contents and
//! embedded metadata for PDF, EPUB, OpenDocument and Office files.

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::extract::{extract_document, Chapter, ExtractError, ExtractedDocument};
use crate::handlers::core::{file_entity, CoreHandler};
use crate::handlers::{truncate_chars, MAX_VALUE_CHARS};
use crate::models::FileDescriptor;
use crate::schema::{SchemaBuilder, TableRef};
use crate::store::Store;
use crate::traits::HandlerPlugin;
use crate::upsert::{Entity, SqlValue, Statement};

const SCHEMA: &str = "document";

const DOCUMENT_MIMES: &[&str] = &[
    "application/epub*",
    "application/pdf",
    "application/x-abiword",
    "application/vnd.oasis.opendocument.*",
    "application/msword",
    "application/vnd.ms-*",
    "application/vnd.openxmlformats-officedocument.*",
];

pub struct DocumentHandler;

fn table(name: &str) -> TableRef {
    TableRef::new(SCHEMA, name)
}

#[async_trait]
impl HandlerPlugin for DocumentHandler {
    fn name(&self) -> &str {
        "file_indexer::handlers::document::DocumentHandler"
    }

    fn handled_mime_patterns(&self) -> Vec<String> {
        DOCUMENT_MIMES.iter().map(|m| m.to_string()).collect()
    }

    fn required_plugins(&self) -> Vec<String> {
        vec!["CoreHandler".to_string()]
    }

    fn database_schema(&self) -> &str {
        SCHEMA
    }

    fn define_tables(&self, schema: &mut SchemaBuilder) {
        schema.table(
            "file_document",
            &[
                "id_file INTEGER NOT NULL UNIQUE",
                "last_update TEXT",
                "title TEXT",
                "author TEXT",
                "pages INTEGER",
                "words INTEGER NOT NULL",
                "characters INTEGER NOT NULL",
            ],
        );
        let chapter = schema.table(
            "chapter",
            &[
                "id_file_document INTEGER NOT NULL REFERENCES file_document(id) ON DELETE CASCADE",
                "id_parent_chapter INTEGER REFERENCES chapter(id) ON DELETE CASCADE",
                "title TEXT NOT NULL",
                "page INTEGER",
            ],
        );
        schema.table("meta_name", &["name TEXT NOT NULL UNIQUE"]);
        let value = schema.table(
            "meta_value",
            &[
                "id_meta_name INTEGER NOT NULL REFERENCES meta_name(id) ON DELETE CASCADE",
                "id_file_document INTEGER NOT NULL REFERENCES file_document(id) ON DELETE CASCADE",
                "value TEXT NOT NULL",
            ],
        );
        schema.index(&chapter, &["id_file_document"]);
        schema.index(&value, &["id_file_document"]);
    }

    async fn handle(&self, file: &FileDescriptor, store: &Store, _config: &Config) -> Result<()> {
        let core_file = file_entity(store, file)
            .await
            .with_context(|| format!("{} row missing", CoreHandler::NAME))?;
        let id_file = core_file.id()?;
        let last_update = core_file.get_str("last_update");

        if let Some(existing) = find_document(store, id_file).await? {
            if existing.get_str("last_update") == last_update {
                tracing::trace!(path = %file.full_path().display(), "document unchanged");
                return Ok(());
            }
            remove_document(store, existing.id()?).await?;
            tracing::debug!(path = %file.full_path().display(), "document modified, re-extracting");
        }

        let owned = file.clone();
        let extracted = tokio::task::spawn_blocking(move || -> Result<Option<ExtractedDocument>> {
            let bytes = owned
                .read_all()
                .with_context(|| format!("Failed to read {}", owned.full_path().display()))?;
            match extract_document(&bytes, owned.mime()) {
                Ok(doc) => Ok(Some(doc)),
                Err(ExtractError::UnsupportedContentType(mime)) => {
                    tracing::debug!(%mime, path = %owned.full_path().display(), "no extractor");
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            }
        })
        .await??;

        let Some(doc) = extracted else {
            return Ok(());
        };

        let document_id = file_document_entity(store, id_file, last_update, &doc)
            .await?
            .id()?;
        store_chapters(store, document_id, None, &doc.chapters).await?;
        for (name, value) in &doc.metadata {
            let name_id = meta_name_entity(store, name).await?.id()?;
            meta_value_entity(store, name_id, document_id, value).await?;
        }

        tracing::debug!(
            path = %file.full_path().display(),
            words = doc.words,
            chapters = doc.chapters.len(),
            "document indexed"
        );
        Ok(())
    }
}

async fn find_document(store: &Store, id_file: i64) -> Result<Option<Entity>> {
    let lookup = Statement::new(format!(
        "SELECT * FROM {} WHERE id_file = ?",
        table("file_document").qualified()
    ))
    .bind(id_file);
    Ok(store.fetch_optional(&lookup).await?)
}

/// Delete a summary together with its chapters and metadata values.
async fn remove_document(store: &Store, document_id: i64) -> Result<()> {
    for (name, column) in [
        ("meta_value", "id_file_document"),
        ("chapter", "id_file_document"),
        ("file_document", "id"),
    ] {
        let delete = Statement::new(format!(
            "DELETE FROM {} WHERE {} = ?",
            table(name).qualified(),
            column
        ))
        .bind(document_id);
        store.execute(&delete).await?;
    }
    Ok(())
}

/// `last_update` is the `core.file` value the summary was extracted from.
async fn file_document_entity(
    store: &Store,
    id_file: i64,
    last_update: Option<&str>,
    doc: &ExtractedDocument,
) -> Result<Entity> {
    let t = table("file_document").qualified();
    let lookup = Statement::new(format!("SELECT * FROM {} WHERE id_file = ?", t)).bind(id_file);
    let insert = Statement::new(format!(
        "INSERT INTO {} (id_file, last_update, title, author, pages, words, characters) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *",
        t
    ))
    .bind(id_file)
    .bind(last_update)
    .bind(doc.title.as_deref().map(|v| truncate_chars(v, MAX_VALUE_CHARS)))
    .bind(doc.author.as_deref().map(|v| truncate_chars(v, MAX_VALUE_CHARS)))
    .bind(doc.pages)
    .bind(doc.words)
    .bind(doc.characters);
    Ok(store.get_or_create(&lookup, &insert, true).await?)
}

/// Depth-first, parents before children.
async fn store_chapters(
    store: &Store,
    document_id: i64,
    parent: Option<i64>,
    chapters: &[Chapter],
) -> Result<()> {
    let mut pending: Vec<(Option<i64>, &Chapter)> =
        chapters.iter().rev().map(|c| (parent, c)).collect();
    while let Some((parent, chapter)) = pending.pop() {
        let id = chapter_entity(store, document_id, parent, chapter).await?.id()?;
        pending.extend(chapter.children.iter().rev().map(|c| (Some(id), c)));
    }
    Ok(())
}

async fn chapter_entity(
    store: &Store,
    document_id: i64,
    parent: Option<i64>,
    chapter: &Chapter,
) -> Result<Entity> {
    let title = truncate_chars(&chapter.title, MAX_VALUE_CHARS);
    let parent = SqlValue::from(parent);
    let t = table("chapter").qualified();
    let lookup = Statement::new(format!(
        "SELECT * FROM {} WHERE id_file_document = ? AND id_parent_chapter IS ? \
         AND title = ? AND page IS ?",
        t
    ))
    .bind(document_id)
    .bind(parent.clone())
    .bind(title.as_str())
    .bind(chapter.page);
    let insert = Statement::new(format!(
        "INSERT INTO {} (id_file_document, id_parent_chapter, title, page) VALUES (?, ?, ?, ?)",
        t
    ))
    .bind(document_id)
    .bind(parent)
    .bind(title.as_str())
    .bind(chapter.page);
    Ok(store.get_or_create(&lookup, &insert, true).await?)
}

async fn meta_name_entity(store: &Store, name: &str) -> Result<Entity> {
    let t = table("meta_name").qualified();
    let lookup = Statement::new(format!("SELECT * FROM {} WHERE name = ?", t)).bind(name);
    let insert = Statement::new(format!("INSERT INTO {} (name) VALUES (?)", t)).bind(name);
    Ok(store.get_or_create(&lookup, &insert, false).await?)
}

async fn meta_value_entity(store: &Store, name_id: i64, document_id: i64, value: &str) -> Result<Entity> {
    let value = truncate_chars(value, MAX_VALUE_CHARS);
    let t = table("meta_value").qualified();
    let lookup = Statement::new(format!(
        "SELECT * FROM {} WHERE id_meta_name = ? AND id_file_document = ? AND value = ?",
        t
    ))
    .bind(name_id)
    .bind(document_id)
    .bind(value.as_str());
    let insert = Statement::new(format!(
        "INSERT INTO {} (id_meta_name, id_file_document, value) VALUES (?, ?, ?)",
        t
    ))
    .bind(name_id)
    .bind(document_id)
    .bind(value.as_str());
    Ok(store.get_or_create(&lookup, &insert, true).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    async fn document_store() -> Store {
        let pool = db::connect_memory(&[SCHEMA.to_string()]).await.unwrap();
        let store = Store::new(pool, Arc::new(Mutex::new(())));
        let mut builder = SchemaBuilder::new(SCHEMA);
        DocumentHandler.define_tables(&mut builder);
        for sql in builder.statements() {
            store.execute(&Statement::new(sql.as_str())).await.unwrap();
        }
        store
    }

    async fn count(store: &Store, sql: &str) -> i64 {
        store
            .fetch_optional(&Statement::new(sql))
            .await
            .unwrap()
            .unwrap()
            .get_i64("n")
            .unwrap()
    }

    fn toc() -> Vec<Chapter> {
        vec![
            Chapter {
                title: "Part One".into(),
                page: Some(1),
                children: vec![
                    Chapter {
                        title: "Loomings".into(),
                        page: Some(2),
                        children: vec![],
                    },
                    Chapter {
                        title: "The Carpet-Bag".into(),
                        page: Some(3),
                        children: vec![],
                    },
                ],
            },
            Chapter {
                title: "Epilogue".into(),
                page: None,
                children: vec![],
            },
        ]
    }

    #[test]
    fn handles_office_and_ebook_mimes() {
        let patterns = DocumentHandler.handled_mime_patterns();
        assert!(patterns.contains(&"application/pdf".to_string()));
        assert!(patterns.iter().any(|p| p.starts_with("application/epub")));
        assert_eq!(DocumentHandler.required_plugins(), vec!["CoreHandler"]);
    }

    #[tokio::test]
    async fn chapters_keep_their_hierarchy_and_are_stored_once() {
        let store = document_store().await;
        let doc = ExtractedDocument {
            words: 10,
            characters: 40,
            chapters: toc(),
            ..Default::default()
        };
        let id = file_document_entity(&store, 7, None, &doc).await.unwrap().id().unwrap();

        store_chapters(&store, id, None, &doc.chapters).await.unwrap();
        store_chapters(&store, id, None, &doc.chapters).await.unwrap();

        assert_eq!(count(&store, r#"SELECT COUNT(*) AS n FROM "document"."chapter""#).await, 4);
        let child_of_part_one = count(
            &store,
            r#"SELECT COUNT(*) AS n FROM "document"."chapter" c
               JOIN "document"."chapter" p ON c.id_parent_chapter = p.id
               WHERE p.title = 'Part One'"#,
        )
        .await;
        assert_eq!(child_of_part_one, 2);
        let roots = count(
            &store,
            r#"SELECT COUNT(*) AS n FROM "document"."chapter" WHERE id_parent_chapter IS NULL"#,
        )
        .await;
        assert_eq!(roots, 2);
    }

    #[tokio::test]
    async fn metadata_names_are_shared_and_values_truncated() {
        let store = document_store().await;
        let doc = ExtractedDocument::default();
        let a = file_document_entity(&store, 1, None, &doc).await.unwrap().id().unwrap();
        let b = file_document_entity(&store, 2, None, &doc).await.unwrap().id().unwrap();

        let name = meta_name_entity(&store, "title").await.unwrap().id().unwrap();
        assert_eq!(meta_name_entity(&store, "title").await.unwrap().id().unwrap(), name);

        let long = "x".repeat(2 * MAX_VALUE_CHARS);
        let stored = meta_value_entity(&store, name, a, &long).await.unwrap();
        assert_eq!(stored.get_str("value").map(str::len), Some(MAX_VALUE_CHARS));
        meta_value_entity(&store, name, b, "short").await.unwrap();
        meta_value_entity(&store, name, b, "short").await.unwrap();

        assert_eq!(count(&store, r#"SELECT COUNT(*) AS n FROM "document"."meta_name""#).await, 1);
        assert_eq!(count(&store, r#"SELECT COUNT(*) AS n FROM "document"."meta_value""#).await, 2);
    }
}
