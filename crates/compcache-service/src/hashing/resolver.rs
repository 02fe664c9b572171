use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{CacheError, CacheResult};

use super::{Digest, hash_file};

/// Resolves the current digest of a header file.
///
/// Manifest validation asks the resolver for every header a candidate recorded. A header that
/// cannot be read resolves to `None` and invalidates the candidate.
pub trait HeaderResolver {
    fn resolve(&self, path: &Path) -> Option<Digest>;
}

/// Identifies a file version without reading it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct InodeKey {
    path: PathBuf,
    device: u64,
    inode: u64,
    mtime: SystemTime,
    ctime: (i64, i64),
    size: u64,
}

impl InodeKey {
    fn new(path: &Path, metadata: &Metadata) -> Option<Self> {
        let (device, inode, ctime) = file_identity(metadata);
        Some(Self {
            path: path.to_owned(),
            device,
            inode,
            mtime: metadata.modified().ok()?,
            ctime,
            size: metadata.len(),
        })
    }
}

#[cfg(unix)]
fn file_identity(metadata: &Metadata) -> (u64, u64, (i64, i64)) {
    use std::os::unix::fs::MetadataExt;
    (
        metadata.dev(),
        metadata.ino(),
        (metadata.ctime(), metadata.ctime_nsec()),
    )
}

#[cfg(not(unix))]
fn file_identity(_metadata: &Metadata) -> (u64, u64, (i64, i64)) {
    (0, 0, (0, 0))
}

/// Files modified this recently are not remembered, since a second write within the timestamp
/// granularity would go unnoticed.
const RACY_WINDOW: Duration = Duration::from_secs(2);

/// An in-process cache of file digests.
///
/// Entries are keyed by path, device, inode, mtime, ctime and size, so any change to a file makes
/// its old entry unreachable. This cache is purely an optimization and never persisted.
#[derive(Clone)]
pub struct InodeCache {
    digests: moka::sync::Cache<InodeKey, Digest>,
}

impl InodeCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            digests: moka::sync::Cache::new(capacity),
        }
    }

    /// Returns the digest of the file at `path`, hashing it only if it changed.
    pub fn hash_file(&self, path: &Path) -> CacheResult<Digest> {
        let metadata = std::fs::metadata(path).map_err(|e| CacheError::io(path, e))?;
        let Some(key) = InodeKey::new(path, &metadata) else {
            return hash_file(path);
        };

        if let Some(digest) = self.digests.get(&key) {
            tracing::trace!("inode cache hit for {}", path.display());
            return Ok(digest);
        }

        let digest = hash_file(path)?;
        let settled = SystemTime::now()
            .duration_since(key.mtime)
            .is_ok_and(|age| age >= RACY_WINDOW);
        if settled {
            self.digests.insert(key, digest);
        }
        Ok(digest)
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl fmt::Debug for InodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeCache")
            .field("entries", &self.digests.entry_count())
            .finish()
    }
}

/// Resolves headers by hashing them from the filesystem.
#[derive(Clone, Debug, Default)]
pub struct FileResolver {
    inode_cache: Option<InodeCache>,
}

impl FileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inode_cache(inode_cache: InodeCache) -> Self {
        Self {
            inode_cache: Some(inode_cache),
        }
    }

    pub fn hash(&self, path: &Path) -> CacheResult<Digest> {
        match &self.inode_cache {
            Some(cache) => cache.hash_file(path),
            None => hash_file(path),
        }
    }
}

impl HeaderResolver for FileResolver {
    fn resolve(&self, path: &Path) -> Option<Digest> {
        match self.hash(path) {
            Ok(digest) => Some(digest),
            Err(error) => {
                tracing::debug!("cannot resolve header: {}", error);
                None
            }
        }
    }
}
