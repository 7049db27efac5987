//! Core data models shared by backends, handlers, and the dispatcher.
//!
//! A filesystem backend produces [`FileDescriptor`]s; handlers and the
//! dispatcher consume them read-only. Content-derived attributes (mime,
//! encoding, description) are computed lazily and cached per descriptor.

use chrono::{DateTime, Utc};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::magic::{self, Sniffed, UNKNOWN};

/// Size and timestamps of one located file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size_bytes: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Backend-specific access to one located file.
///
/// Implemented by filesystem backends (local disk, network shares, test
/// fixtures). The dispatcher never touches the underlying storage directly.
pub trait FileHandle: Send + Sync + fmt::Debug {
    /// Absolute logical path within the backend.
    fn full_path(&self) -> &Path;

    /// Scheme and host, e.g. `file://localhost` or `smb://nas`.
    ///
    /// Disambiguates identical paths across data sources and backends.
    fn scheme_and_host(&self) -> &str;

    /// Size and timestamps.
    fn stat(&self) -> std::io::Result<FileStat>;

    /// Open a readable stream over the file's content.
    fn open(&self) -> std::io::Result<Box<dyn Read + Send>>;
}

/// Options fixed when a listing is created and reused on every replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub ignore_patterns: Vec<String>,
    pub follow_symlinks: bool,
}

/// One located file, as seen by handlers.
///
/// Cheap to clone: clones share the handle and the lazily computed values.
#[derive(Clone)]
pub struct FileDescriptor {
    inner: Arc<DescriptorInner>,
}

struct DescriptorInner {
    handle: Arc<dyn FileHandle>,
    stat: OnceLock<Option<FileStat>>,
    sniffed: OnceLock<Sniffed>,
}

impl FileDescriptor {
    pub fn new(handle: Arc<dyn FileHandle>) -> Self {
        Self {
            inner: Arc::new(DescriptorInner {
                handle,
                stat: OnceLock::new(),
                sniffed: OnceLock::new(),
            }),
        }
    }

    pub fn full_path(&self) -> &Path {
        self.inner.handle.full_path()
    }

    /// Final path component.
    pub fn file_name(&self) -> String {
        self.full_path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Directory containing the file.
    pub fn parent_path(&self) -> PathBuf {
        self.full_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn scheme_and_host(&self) -> &str {
        self.inner.handle.scheme_and_host()
    }

    /// Cached stat; `None` when the backend could not stat the file.
    pub fn stat(&self) -> Option<FileStat> {
        *self.inner.stat.get_or_init(|| match self.inner.handle.stat() {
            Ok(stat) => Some(stat),
            Err(e) => {
                tracing::debug!(path = %self.full_path().display(), error = %e, "stat failed");
                None
            }
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.stat().map(|s| s.size_bytes).unwrap_or(0)
    }

    pub fn size_kb(&self) -> i64 {
        (self.size_bytes() / 1024) as i64
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.stat().map(|s| s.created)
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.stat().map(|s| s.modified)
    }

    /// Sniffed mime type, `"__UNKNOWN__"` when the content cannot be read.
    pub fn mime(&self) -> &str {
        &self.sniffed().mime
    }

    /// Sniffed character encoding (`us-ascii`, `utf-8`, `binary`).
    pub fn encoding(&self) -> &str {
        &self.sniffed().encoding
    }

    /// Free-text content description.
    pub fn description(&self) -> &str {
        &self.sniffed().description
    }

    pub fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        self.inner.handle.open()
    }

    /// Read the whole content into memory.
    pub fn read_all(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size_bytes() as usize);
        self.open()?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn sniffed(&self) -> &Sniffed {
        self.inner.sniffed.get_or_init(|| {
            match self.open().and_then(magic::read_head) {
                Ok(head) => magic::sniff(&head),
                Err(e) => {
                    tracing::error!(
                        path = %self.full_path().display(),
                        error = %e,
                        "unable to read file header"
                    );
                    Sniffed {
                        mime: UNKNOWN.to_string(),
                        encoding: UNKNOWN.to_string(),
                        description: UNKNOWN.to_string(),
                    }
                }
            }
        })
    }
}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("path", &self.full_path())
            .field("scheme_and_host", &self.scheme_and_host())
            .finish()
    }
}
