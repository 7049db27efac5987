//! Filesystem backend contract and the scheme registry.
//!
//! A backend turns a data source URI into a connection; a connection lists
//! files as a lazy, single-pass sequence of [`FileDescriptor`]s. The dispatcher
//! only ever sees these two traits, so network shares and test fixtures plug in
//! the same way as the built-in local backend.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use crate::config::DataSourceConfig;
use crate::connector_fs::LocalFileSystem;
use crate::error::IndexerError;
use crate::models::{FileDescriptor, ListOptions};

/// Lazy, finite, single-pass listing.
pub type FileListing = Box<dyn Iterator<Item = Result<FileDescriptor>> + Send>;

/// A data source location split into scheme, host, and path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceUri {
    pub scheme: String,
    pub host: Option<String>,
    pub path: PathBuf,
}

impl DataSourceUri {
    /// Parse a URI; bare paths (absolute or relative) use the `file` scheme.
    pub fn parse(raw: &str) -> Result<Self, IndexerError> {
        match Url::parse(raw) {
            // Single-letter schemes are Windows drive letters, not URIs.
            Ok(url) if url.scheme().len() > 1 => {
                let path = if url.scheme() == "file" {
                    url.to_file_path()
                        .unwrap_or_else(|_| PathBuf::from(url.path()))
                } else {
                    PathBuf::from(url.path())
                };
                Ok(Self {
                    scheme: url.scheme().to_string(),
                    host: url.host_str().filter(|h| !h.is_empty()).map(str::to_string),
                    path,
                })
            }
            Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Self {
                scheme: "file".to_string(),
                host: None,
                path: PathBuf::from(raw),
            }),
            Err(e) => Err(IndexerError::Config(format!(
                "invalid data source URI '{}': {}",
                raw, e
            ))),
        }
    }

    /// `scheme://host`, with `localhost` standing in for a missing host.
    pub fn scheme_and_host(&self) -> String {
        format!(
            "{}://{}",
            self.scheme,
            self.host.as_deref().unwrap_or("localhost")
        )
    }
}

/// A filesystem backend registered for one or more URI schemes.
pub trait FileSystemBackend: Send + Sync {
    /// Backend identity, e.g. `"local"`.
    fn name(&self) -> &str;

    /// URI schemes this backend serves.
    fn schemes(&self) -> Vec<&'static str>;

    /// Open a connection for one data source.
    fn connect(
        &self,
        uri: &DataSourceUri,
        source: &DataSourceConfig,
    ) -> Result<Arc<dyn FileSystemConnection>>;
}

/// A connected data source.
pub trait FileSystemConnection: Send + Sync {
    /// Start a listing. Called at most once per enumeration cache.
    fn list_files(&self, options: &ListOptions) -> Result<FileListing>;
}

/// Maps URI schemes to backends.
///
/// Later registrations win for a scheme, so custom backends can replace
/// the built-in local one.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn FileSystemBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the local filesystem backend.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalFileSystem));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn FileSystemBackend>) {
        self.backends.push(backend);
    }

    /// Backend serving `scheme`, if any.
    pub fn for_scheme(&self, scheme: &str) -> Option<Arc<dyn FileSystemBackend>> {
        self.backends
            .iter()
            .rev()
            .find(|b| b.schemes().iter().any(|s| s.eq_ignore_ascii_case(scheme)))
            .cloned()
    }

    /// Resolve the backend for a configured data source.
    pub fn resolve(
        &self,
        source: &DataSourceConfig,
    ) -> Result<(Arc<dyn FileSystemBackend>, DataSourceUri), IndexerError> {
        let uri = DataSourceUri::parse(&source.path)?;
        let backend = self
            .for_scheme(&uri.scheme)
            .ok_or_else(|| IndexerError::UnknownScheme(uri.scheme.clone()))?;
        Ok((backend, uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_paths_are_local() {
        let uri = DataSourceUri::parse("/srv/music").unwrap();
        assert_eq!(uri.scheme, "file");
        assert_eq!(uri.path, PathBuf::from("/srv/music"));
        assert_eq!(uri.scheme_and_host(), "file://localhost");

        let rel = DataSourceUri::parse("data/books").unwrap();
        assert_eq!(rel.scheme, "file");
        assert_eq!(rel.path, PathBuf::from("data/books"));
    }

    #[test]
    fn file_and_network_uris() {
        let uri = DataSourceUri::parse("file:///srv/music").unwrap();
        assert_eq!(uri.scheme, "file");
        assert_eq!(uri.path, PathBuf::from("/srv/music"));

        let smb = DataSourceUri::parse("smb://nas/share/music").unwrap();
        assert_eq!(smb.scheme, "smb");
        assert_eq!(smb.host.as_deref(), Some("nas"));
        assert_eq!(smb.path, PathBuf::from("/share/music"));
        assert_eq!(smb.scheme_and_host(), "smb://nas");
    }

    #[test]
    fn unknown_scheme_is_reported() {
        let registry = BackendRegistry::with_builtins();
        let err = registry
            .resolve(&DataSourceConfig::new("smb://nas/share"))
            .err()
            .unwrap();
        assert!(matches!(err, IndexerError::UnknownScheme(ref s) if s == "smb"));

        let (backend, _) = registry
            .resolve(&DataSourceConfig::new("/tmp"))
            .unwrap();
        assert_eq!(backend.name(), "local");
    }
}
