//! Audio properties and tags via `lofty`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lofty::file::TaggedFileExt;
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, ItemValue};
use std::io::Cursor;

use crate::config::Config;
use crate::handlers::core::{file_entity, CoreHandler};
use crate::handlers::{truncate_chars, MAX_VALUE_CHARS};
use crate::models::FileDescriptor;
use crate::schema::{SchemaBuilder, TableRef};
use crate::store::Store;
use crate::traits::HandlerPlugin;
use crate::upsert::{Entity, Statement};

const SCHEMA: &str = "audio";

/// Containers that carry no tags worth reading.
const UNTAGGED_MIMES: &[&str] = &["audio/x-wav", "audio/wav"];

pub struct AudioHandler;

fn table(name: &str) -> TableRef {
    TableRef::new(SCHEMA, name)
}

/// What `lofty` reports for one file.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AudioProperties {
    pub duration_ms: i64,
    pub bitrate_kbps: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub bit_depth: Option<u32>,
    pub tags: Vec<(String, String)>,
}

#[async_trait]
impl HandlerPlugin for AudioHandler {
    fn name(&self) -> &str {
        "file_indexer::handlers::audio::AudioHandler"
    }

    fn handled_mime_patterns(&self) -> Vec<String> {
        vec!["audio/*".to_string()]
    }

    fn required_plugins(&self) -> Vec<String> {
        vec!["CoreHandler".to_string()]
    }

    fn database_schema(&self) -> &str {
        SCHEMA
    }

    fn define_tables(&self, schema: &mut SchemaBuilder) {
        schema.table(
            "audio_file",
            &[
                "id_file INTEGER NOT NULL UNIQUE",
                "last_update TEXT",
                "duration_ms INTEGER NOT NULL",
                "bitrate_kbps INTEGER",
                "sample_rate INTEGER",
                "channels INTEGER",
                "bit_depth INTEGER",
            ],
        );
        schema.table("meta_name", &["name TEXT NOT NULL UNIQUE"]);
        let value = schema.table(
            "meta_value",
            &[
                "id_meta_name INTEGER NOT NULL REFERENCES meta_name(id) ON DELETE CASCADE",
                "id_audio_file INTEGER NOT NULL REFERENCES audio_file(id) ON DELETE CASCADE",
                "value TEXT NOT NULL",
            ],
        );
        schema.index(&value, &["id_audio_file"]);
    }

    fn can_handle(&self, file: &FileDescriptor) -> bool {
        !UNTAGGED_MIMES.contains(&file.mime())
    }

    async fn handle(&self, file: &FileDescriptor, store: &Store, _config: &Config) -> Result<()> {
        let core_file = file_entity(store, file)
            .await
            .with_context(|| format!("{} row missing", CoreHandler::NAME))?;
        let id_file = core_file.id()?;
        let last_update = core_file.get_str("last_update");

        if let Some(existing) = find_audio_file(store, id_file).await? {
            if existing.get_str("last_update") == last_update {
                tracing::trace!(path = %file.full_path().display(), "audio unchanged");
                return Ok(());
            }
            remove_audio_file(store, existing.id()?).await?;
            tracing::debug!(path = %file.full_path().display(), "audio modified, re-reading");
        }

        let owned = file.clone();
        let properties = tokio::task::spawn_blocking(move || read_properties(&owned)).await??;

        let audio = audio_file_entity(store, id_file, last_update, &properties).await?;
        let audio_id = audio.id()?;
        for (name, value) in &properties.tags {
            let name_id = meta_name_entity(store, name).await?.id()?;
            meta_value_entity(store, name_id, audio_id, value).await?;
        }
        tracing::debug!(
            path = %file.full_path().display(),
            tags = properties.tags.len(),
            "audio indexed"
        );
        Ok(())
    }
}

/// Read stream properties and every textual tag item.
pub fn read_properties(file: &FileDescriptor) -> Result<AudioProperties> {
    let bytes = file
        .read_all()
        .with_context(|| format!("Failed to read {}", file.full_path().display()))?;
    let tagged = Probe::new(Cursor::new(bytes)).guess_file_type()?.read()?;

    let props = tagged.properties();
    let mut properties = AudioProperties {
        duration_ms: props.duration().as_millis() as i64,
        bitrate_kbps: props.audio_bitrate(),
        sample_rate: props.sample_rate(),
        channels: props.channels().map(u32::from),
        bit_depth: props.bit_depth().map(u32::from),
        tags: Vec::new(),
    };

    if let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) {
        for item in tag.items() {
            let value = match item.value() {
                ItemValue::Text(text) | ItemValue::Locator(text) => text.trim(),
                ItemValue::Binary(_) => continue,
            };
            if value.is_empty() {
                continue;
            }
            let name = match item.key() {
                ItemKey::Unknown(raw) => raw.clone(),
                key => format!("{:?}", key),
            };
            properties.tags.push((name, value.to_string()));
        }
    }
    Ok(properties)
}

async fn find_audio_file(store: &Store, id_file: i64) -> Result<Option<Entity>> {
    let lookup = Statement::new(format!(
        "SELECT * FROM {} WHERE id_file = ?",
        table("audio_file").qualified()
    ))
    .bind(id_file);
    Ok(store.fetch_optional(&lookup).await?)
}

async fn remove_audio_file(store: &Store, audio_id: i64) -> Result<()> {
    for (name, column) in [("meta_value", "id_audio_file"), ("audio_file", "id")] {
        let delete = Statement::new(format!(
            "DELETE FROM {} WHERE {} = ?",
            table(name).qualified(),
            column
        ))
        .bind(audio_id);
        store.execute(&delete).await?;
    }
    Ok(())
}

async fn audio_file_entity(
    store: &Store,
    id_file: i64,
    last_update: Option<&str>,
    p: &AudioProperties,
) -> Result<Entity> {
    let t = table("audio_file").qualified();
    let lookup = Statement::new(format!("SELECT * FROM {} WHERE id_file = ?", t)).bind(id_file);
    let insert = Statement::new(format!(
        "INSERT INTO {} (id_file, last_update, duration_ms, bitrate_kbps, sample_rate, channels, \
         bit_depth) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *",
        t
    ))
    .bind(id_file)
    .bind(last_update)
    .bind(p.duration_ms)
    .bind(p.bitrate_kbps)
    .bind(p.sample_rate)
    .bind(p.channels)
    .bind(p.bit_depth);
    Ok(store.get_or_create(&lookup, &insert, true).await?)
}

async fn meta_name_entity(store: &Store, name: &str) -> Result<Entity> {
    let t = table("meta_name").qualified();
    let lookup = Statement::new(format!("SELECT * FROM {} WHERE name = ?", t)).bind(name);
    let insert = Statement::new(format!("INSERT INTO {} (name) VALUES (?)", t)).bind(name);
    Ok(store.get_or_create(&lookup, &insert, false).await?)
}

async fn meta_value_entity(store: &Store, name_id: i64, audio_id: i64, value: &str) -> Result<Entity> {
    let value = truncate_chars(value, MAX_VALUE_CHARS);
    let t = table("meta_value").qualified();
    let lookup = Statement::new(format!(
        "SELECT * FROM {} WHERE id_meta_name = ? AND id_audio_file = ? AND value = ?",
        t
    ))
    .bind(name_id)
    .bind(audio_id)
    .bind(value.as_str());
    let insert = Statement::new(format!(
        "INSERT INTO {} (id_meta_name, id_audio_file, value) VALUES (?, ?, ?)",
        t
    ))
    .bind(name_id)
    .bind(audio_id)
    .bind(value.as_str());
    Ok(store.get_or_create(&lookup, &insert, true).await?)
}
