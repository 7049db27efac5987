use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::backend::{DataSourceUri, FileListing, FileSystemBackend, FileSystemConnection};
use crate::config::DataSourceConfig;
use crate::models::{FileDescriptor, FileHandle, FileStat, ListOptions};

/// Local disk backend for `file://` URIs and bare paths.
pub struct LocalFileSystem;

impl FileSystemBackend for LocalFileSystem {
    fn name(&self) -> &str {
        "local"
    }

    fn schemes(&self) -> Vec<&'static str> {
        vec!["file"]
    }

    fn connect(
        &self,
        uri: &DataSourceUri,
        _source: &DataSourceConfig,
    ) -> Result<Arc<dyn FileSystemConnection>> {
        let root = std::path::absolute(&uri.path)?;
        if !root.exists() {
            bail!("Data source root does not exist: {}", root.display());
        }
        Ok(Arc::new(LocalConnection {
            root,
            scheme_and_host: Arc::from(uri.scheme_and_host()),
        }))
    }
}

struct LocalConnection {
    root: PathBuf,
    scheme_and_host: Arc<str>,
}

impl FileSystemConnection for LocalConnection {
    fn list_files(&self, options: &ListOptions) -> Result<FileListing> {
        let ignore_set = build_globset(&options.ignore_patterns)?;
        let root = self.root.clone();
        let scheme_and_host = Arc::clone(&self.scheme_and_host);

        let walker = WalkDir::new(&self.root)
            .follow_links(options.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry({
                let root = root.clone();
                move |entry| {
                    let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                    relative.as_os_str().is_empty() || !ignore_set.is_match(relative)
                }
            });

        let files = walker.filter_map(move |entry| match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let handle = LocalFile {
                    path: entry.into_path(),
                    scheme_and_host: Arc::clone(&scheme_and_host),
                };
                Some(Ok(FileDescriptor::new(Arc::new(handle))))
            }
            Ok(_) => None,
            Err(e) => Some(Err(anyhow::Error::new(e).context(format!(
                "Failed to walk {}",
                root.display()
            )))),
        });

        Ok(Box::new(files))
    }
}

#[derive(Debug)]
struct LocalFile {
    path: PathBuf,
    scheme_and_host: Arc<str>,
}

impl FileHandle for LocalFile {
    fn full_path(&self) -> &Path {
        &self.path
    }

    fn scheme_and_host(&self) -> &str {
        &self.scheme_and_host
    }

    fn stat(&self) -> std::io::Result<FileStat> {
        let metadata = std::fs::metadata(&self.path)?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let created = metadata.created().unwrap_or(modified);
        Ok(FileStat {
            size_bytes: metadata.len(),
            created: DateTime::<Utc>::from(created),
            modified: DateTime::<Utc>::from(modified),
        })
    }

    fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(&self.path)?))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
