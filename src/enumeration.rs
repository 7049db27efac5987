//! Replayable file enumeration.
//!
//! Listing a data source can be expensive (recursive walks, network
//! listings) and is single-pass. [`FileEnumerationCache`] starts the listing
//! once, buffers descriptors as they are pulled, and replays the buffer for
//! every later traversal, so each plugin of each step iterates the same
//! sequence without touching the backend again.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{FileListing, FileSystemConnection};
use crate::models::{FileDescriptor, ListOptions};

pub struct FileEnumerationCache {
    connection: Arc<dyn FileSystemConnection>,
    options: ListOptions,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    started: bool,
    source: Option<FileListing>,
    buffer: Vec<FileDescriptor>,
    exhausted: bool,
    start_error: Option<String>,
}

impl FileEnumerationCache {
    /// Wrap a connection; `options` are fixed for every replay.
    pub fn new(connection: Arc<dyn FileSystemConnection>, options: ListOptions) -> Self {
        Self {
            connection,
            options,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn options(&self) -> &ListOptions {
        &self.options
    }

    /// Start a traversal from the first file.
    ///
    /// The first call starts the underlying listing; if that fails, this and
    /// every later call return the same error.
    pub fn iter(&self) -> Result<CachedFiles<'_>> {
        self.start()?;
        Ok(CachedFiles {
            cache: self,
            index: 0,
        })
    }

    /// Start the underlying listing if no traversal has yet.
    ///
    /// Blocks on the backend for the first call only; a start failure is
    /// returned again on every later call.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.started {
            state.started = true;
            match self.connection.list_files(&self.options) {
                Ok(listing) => state.source = Some(listing),
                Err(e) => {
                    state.exhausted = true;
                    state.start_error = Some(format!("{:#}", e));
                }
            }
        }
        if let Some(message) = &state.start_error {
            return Err(anyhow!("listing failed: {}", message));
        }
        Ok(())
    }

    /// Number of descriptors pulled from the backend so far.
    pub fn len_buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Whether the underlying listing has been fully consumed.
    pub fn is_exhausted(&self) -> bool {
        self.lock().exhausted
    }

    /// The descriptor at `index` of every traversal, pulling from the
    /// backend when it is not buffered yet. `None` past the end or before
    /// [`start`](Self::start).
    pub fn get(&self, index: usize) -> Option<FileDescriptor> {
        let mut state = self.lock();
        if let Some(file) = state.buffer.get(index) {
            return Some(file.clone());
        }
        if state.exhausted || !state.started {
            return None;
        }
        loop {
            let next = state.source.as_mut().and_then(|source| source.next());
            match next {
                Some(Ok(file)) => {
                    state.buffer.push(file.clone());
                    return Some(file);
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %format!("{:#}", e), "skipping unreadable entry");
                }
                None => {
                    state.exhausted = true;
                    state.source = None;
                    return None;
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One traversal over a [`FileEnumerationCache`].
pub struct CachedFiles<'a> {
    cache: &'a FileEnumerationCache,
    index: usize,
}

impl Iterator for CachedFiles<'_> {
    type Item = FileDescriptor;

    fn next(&mut self) -> Option<FileDescriptor> {
        let file = self.cache.get(self.index)?;
        self.index += 1;
        Some(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileHandle, FileStat};
    use std::io::Read;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct NamedFile(PathBuf);

    impl FileHandle for NamedFile {
        fn full_path(&self) -> &Path {
            &self.0
        }
        fn scheme_and_host(&self) -> &str {
            "mem://test"
        }
        fn stat(&self) -> std::io::Result<FileStat> {
            Err(std::io::Error::other("no stat"))
        }
        fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(std::io::empty()))
        }
    }

    /// A connection whose listing can only be started once and counts pulls.
    struct OneShot {
        names: Vec<&'static str>,
        listings: AtomicUsize,
        pulls: Arc<AtomicUsize>,
        fail_at: Option<usize>,
    }

    impl OneShot {
        fn new(names: Vec<&'static str>) -> Self {
            Self {
                names,
                listings: AtomicUsize::new(0),
                pulls: Arc::new(AtomicUsize::new(0)),
                fail_at: None,
            }
        }
    }

    impl FileSystemConnection for OneShot {
        fn list_files(&self, _options: &ListOptions) -> Result<FileListing> {
            if self.listings.fetch_add(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("listing is single-pass");
            }
            let pulls = Arc::clone(&self.pulls);
            let fail_at = self.fail_at;
            let names = self.names.clone();
            Ok(Box::new(names.into_iter().enumerate().map(move |(i, n)| {
                pulls.fetch_add(1, Ordering::SeqCst);
                if Some(i) == fail_at {
                    anyhow::bail!("permission denied");
                }
                Ok(FileDescriptor::new(Arc::new(NamedFile(PathBuf::from(n)))))
            })))
        }
    }

    fn paths(iter: CachedFiles<'_>) -> Vec<PathBuf> {
        iter.map(|f| f.full_path().to_path_buf()).collect()
    }

    #[test]
    fn replays_identical_sequence_from_single_pass_source() {
        let conn = Arc::new(OneShot::new(vec!["/a", "/b", "/c"]));
        let cache = FileEnumerationCache::new(conn.clone(), ListOptions::default());

        let first = paths(cache.iter().unwrap());
        let second = paths(cache.iter().unwrap());

        assert_eq!(first, vec![PathBuf::from("/a"), "/b".into(), "/c".into()]);
        assert_eq!(first, second);
        assert_eq!(conn.listings.load(Ordering::SeqCst), 1);
        assert_eq!(conn.pulls.load(Ordering::SeqCst), 3);
        assert!(cache.is_exhausted());
    }

    #[test]
    fn interleaved_traversals_share_the_buffer() {
        let conn = Arc::new(OneShot::new(vec!["/a", "/b", "/c"]));
        let cache = FileEnumerationCache::new(conn.clone(), ListOptions::default());

        let mut left = cache.iter().unwrap();
        let mut right = cache.iter().unwrap();
        assert_eq!(left.next().unwrap().full_path(), Path::new("/a"));
        assert_eq!(left.next().unwrap().full_path(), Path::new("/b"));
        assert_eq!(cache.len_buffered(), 2);
        assert_eq!(right.next().unwrap().full_path(), Path::new("/a"));
        assert_eq!(paths(right), vec![PathBuf::from("/b"), "/c".into()]);
        assert_eq!(paths(left), vec![PathBuf::from("/c")]);
        assert_eq!(conn.pulls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unreadable_entries_are_skipped_not_buffered() {
        let mut conn = OneShot::new(vec!["/a", "/bad", "/c"]);
        conn.fail_at = Some(1);
        let cache = FileEnumerationCache::new(Arc::new(conn), ListOptions::default());

        let expected = vec![PathBuf::from("/a"), PathBuf::from("/c")];
        assert_eq!(paths(cache.iter().unwrap()), expected);
        assert_eq!(paths(cache.iter().unwrap()), expected);
    }

    #[test]
    fn listing_is_not_started_until_first_traversal() {
        let conn = Arc::new(OneShot::new(vec!["/a"]));
        let cache = FileEnumerationCache::new(conn.clone(), ListOptions::default());
        assert_eq!(conn.listings.load(Ordering::SeqCst), 0);
        let _ = cache.iter().unwrap();
        assert_eq!(conn.listings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn indexed_access_matches_traversal() {
        let conn = Arc::new(OneShot::new(vec!["/a", "/b"]));
        let cache = FileEnumerationCache::new(conn.clone(), ListOptions::default());
        assert!(cache.get(0).is_none());

        cache.start().unwrap();
        cache.start().unwrap();
        assert_eq!(cache.get(1).unwrap().full_path(), Path::new("/b"));
        assert_eq!(cache.get(0).unwrap().full_path(), Path::new("/a"));
        assert!(cache.get(2).is_none());
        assert_eq!(paths(cache.iter().unwrap()), vec![PathBuf::from("/a"), "/b".into()]);
        assert_eq!(conn.listings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_failure_is_sticky() {
        let conn = Arc::new(OneShot::new(vec!["/a"]));
        conn.listings.store(1, Ordering::SeqCst);
        let cache = FileEnumerationCache::new(conn.clone(), ListOptions::default());
        assert!(cache.iter().is_err());
        assert!(cache.iter().is_err());
        assert_eq!(conn.listings.load(Ordering::SeqCst), 2);
    }
}
