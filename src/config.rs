use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Directory holding one SQLite file per handler schema.
    pub dir: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Overrides the driver-reported capability ordinal (0..=3).
    #[serde(default)]
    pub thread_safety: Option<u8>,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-WorkItem timeout; 0 waits indefinitely.
    #[serde(default = "default_work_item_timeout_secs")]
    pub work_item_timeout_secs: u64,
    /// Handler plugins to load in addition to the core handler.
    #[serde(default)]
    pub handlers: Vec<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            work_item_timeout_secs: default_work_item_timeout_secs(),
            handlers: Vec::new(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_work_item_timeout_secs() -> u64 {
    300
}

/// One configured data source.
///
/// Accepts either a bare path/URI string or a table.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(from = "RawDataSource")]
pub struct DataSourceConfig {
    pub path: String,
    pub ignore_patterns: Vec<String>,
    pub follow_symlinks: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDataSource {
    Path(String),
    Table {
        path: String,
        #[serde(default)]
        ignore_patterns: Vec<String>,
        #[serde(default)]
        follow_symlinks: bool,
    },
}

impl From<RawDataSource> for DataSourceConfig {
    fn from(raw: RawDataSource) -> Self {
        match raw {
            RawDataSource::Path(path) => Self::new(path),
            RawDataSource::Table {
                path,
                ignore_patterns,
                follow_symlinks,
            } => Self {
                path,
                ignore_patterns,
                follow_symlinks,
            },
        }
    }
}

impl DataSourceConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ignore_patterns: Vec::new(),
            follow_symlinks: false,
        }
    }
}

impl Config {
    /// A configuration with no data sources, storing under `db_dir`.
    pub fn minimal(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                dir: db_dir.into(),
                max_connections: default_max_connections(),
                thread_safety: None,
            },
            crawler: CrawlerConfig::default(),
            data_sources: Vec::new(),
        }
    }

    pub fn work_item_timeout(&self) -> Option<std::time::Duration> {
        match self.crawler.work_item_timeout_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.crawler.workers == 0 {
        anyhow::bail!("crawler.workers must be >= 1");
    }

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }

    if let Some(level) = config.db.thread_safety {
        if level > 3 {
            anyhow::bail!("db.thread_safety must be in [0, 3], got {}", level);
        }
    }

    if config.data_sources.is_empty() {
        anyhow::bail!("No configured data sources. At least one [[data_sources]] entry is required.");
    }

    for source in &config.data_sources {
        if source.path.trim().is_empty() {
            anyhow::bail!("data_sources entries must have a non-empty path");
        }
        for pattern in &source.ignore_patterns {
            globset::Glob::new(pattern).with_context(|| {
                format!(
                    "Invalid ignore pattern '{}' for data source {}",
                    pattern, source.path
                )
            })?;
        }
    }

    Ok(())
}
