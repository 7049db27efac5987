//! The handler plugin contract and the plugin registry.
//!
//! A handler plugin owns one database schema, declares the mime types it
//! handles and the plugins it depends on, and is invoked once per matching
//! file by the dispatcher.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             PluginRegistry               │
//! │  ┌─────────┐ ┌─────────┐ ┌────────────┐  │
//! │  │  Core   │ │  Audio  │ │  Custom    │  │
//! │  │ Handler │ │Document │ │  (Rust)    │  │
//! │  └─────────┘ └─────────┘ └────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼  load(config)
//!          build_plan() → ExecutionPlan
//!                ▼
//!          Dispatcher::dispatch()
//! ```
//!
//! # Usage
//!
//! ```rust
//! use file_indexer::traits::PluginRegistry;
//!
//! let plugins = PluginRegistry::with_builtins();
//! assert!(plugins.get("CoreHandler").is_some());
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::IndexerError;
use crate::handlers::audio::AudioHandler;
use crate::handlers::core::CoreHandler;
use crate::handlers::document::DocumentHandler;
use crate::models::FileDescriptor;
use crate::schema::{SchemaBuilder, TableRef};
use crate::store::Store;

// ═══════════════════════════════════════════════════════════════════════
// HandlerPlugin Trait
// ═══════════════════════════════════════════════════════════════════════

/// A file handler that persists metadata into its own schema.
///
/// # Lifecycle
///
/// 1. The plugin is registered via [`PluginRegistry::register`] and named
///    in `crawler.handlers`.
/// 2. The resolver places it in a step after every plugin it requires.
/// 3. [`define_tables`](HandlerPlugin::define_tables) runs once, in plan
///    order, before any file is handled.
/// 4. [`handle`](HandlerPlugin::handle) is called for every file whose mime
///    matches [`handled_mime_patterns`](HandlerPlugin::handled_mime_patterns)
///    and which [`can_handle`](HandlerPlugin::can_handle) accepts.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use file_indexer::config::Config;
/// use file_indexer::models::FileDescriptor;
/// use file_indexer::schema::SchemaBuilder;
/// use file_indexer::store::Store;
/// use file_indexer::traits::HandlerPlugin;
///
/// pub struct ImageHandler;
///
/// #[async_trait]
/// impl HandlerPlugin for ImageHandler {
///     fn name(&self) -> &str { "my_crate::ImageHandler" }
///     fn handled_mime_patterns(&self) -> Vec<String> { vec!["image/*".into()] }
///     fn required_plugins(&self) -> Vec<String> { vec!["CoreHandler".into()] }
///     fn database_schema(&self) -> &str { "image" }
///
///     fn define_tables(&self, schema: &mut SchemaBuilder) {
///         schema.table("image_file", &["id_file INTEGER NOT NULL UNIQUE", "width INTEGER"]);
///     }
///
///     async fn handle(&self, _file: &FileDescriptor, _store: &Store, _config: &Config) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait HandlerPlugin: Send + Sync {
    /// Fully-qualified identity, e.g. `"file_indexer::handlers::core::CoreHandler"`.
    ///
    /// Requirements name plugins either by this identity or by a trailing
    /// `::`-separated suffix of it (`"CoreHandler"`, `"core::CoreHandler"`).
    fn name(&self) -> &str;

    /// Glob patterns over mime types (`"audio/*"`, `"application/pdf"`).
    fn handled_mime_patterns(&self) -> Vec<String>;

    /// Plugins that must complete a file before this one sees it.
    fn required_plugins(&self) -> Vec<String> {
        Vec::new()
    }

    /// Attached database this plugin owns.
    fn database_schema(&self) -> &str;

    /// Declare this plugin's tables.
    fn define_tables(&self, schema: &mut SchemaBuilder);

    /// Tables dependent plugins may reference, by table name.
    ///
    /// Defaults to every table declared by
    /// [`define_tables`](HandlerPlugin::define_tables).
    fn shared_tables(&self) -> BTreeMap<String, TableRef> {
        let mut builder = SchemaBuilder::new(self.database_schema());
        self.define_tables(&mut builder);
        builder
            .tables()
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect()
    }

    /// Extra per-file filter after the mime match. Defaults to `true`.
    fn can_handle(&self, _file: &FileDescriptor) -> bool {
        true
    }

    /// Process one file. Errors are reported per file and never abort the run.
    async fn handle(&self, file: &FileDescriptor, store: &Store, config: &Config) -> Result<()>;
}

/// Returns `true` if `wanted` names the plugin `full_name`.
///
/// Exact match, or `wanted` is a trailing run of whole `::` segments.
pub fn name_matches(full_name: &str, wanted: &str) -> bool {
    if full_name == wanted {
        return true;
    }
    full_name
        .strip_suffix(wanted)
        .is_some_and(|prefix| prefix.ends_with("::"))
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry of available handler plugins (built-in and custom).
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn HandlerPlugin>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `CoreHandler`, `AudioHandler` and `DocumentHandler`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CoreHandler));
        registry.register(Arc::new(AudioHandler));
        registry.register(Arc::new(DocumentHandler));
        registry
    }

    /// Add a plugin, replacing any plugin with the same identity.
    pub fn register(&mut self, plugin: Arc<dyn HandlerPlugin>) {
        self.plugins.retain(|p| p.name() != plugin.name());
        self.plugins.push(plugin);
    }

    /// Look up by exact identity, then by `::` suffix.
    pub fn get(&self, name: &str) -> Option<Arc<dyn HandlerPlugin>> {
        self.plugins
            .iter()
            .find(|p| p.name() == name)
            .or_else(|| self.plugins.iter().find(|p| name_matches(p.name(), name)))
            .cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// The plugin set for a run: `CoreHandler` first, then `crawler.handlers`
    /// in configured order, without duplicates.
    pub fn load(&self, config: &Config) -> Result<Vec<Arc<dyn HandlerPlugin>>, IndexerError> {
        let mut loaded: Vec<Arc<dyn HandlerPlugin>> = Vec::new();
        let core = std::iter::once(CoreHandler::NAME);
        for name in core.chain(config.crawler.handlers.iter().map(String::as_str)) {
            let plugin = self
                .get(name)
                .ok_or_else(|| IndexerError::Config(format!("unknown handler '{}'", name)))?;
            if !loaded.iter().any(|p| p.name() == plugin.name()) {
                loaded.push(plugin);
            }
        }
        Ok(loaded)
    }

    /// A table another plugin has published via
    /// [`HandlerPlugin::shared_tables`].
    pub fn shared_table(&self, plugin: &str, table: &str) -> Option<TableRef> {
        self.get(plugin)?.shared_tables().remove(table)
    }
}
