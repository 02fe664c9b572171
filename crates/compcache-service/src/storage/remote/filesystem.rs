use std::io;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::error::{CacheError, CacheResult};
use crate::storage::local::TMP_PREFIX;
use crate::storage::{StorageKey, StoreResult};
use crate::utils::tmpfiles;

/// A secondary backend in a shared directory, e.g. on a network filesystem.
///
/// Keys are laid out with a single level of shard directories. Blobs are immutable once written,
/// so existing files are never overwritten.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    path: PathBuf,
}

impl FilesystemBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn path_for(&self, key: &StorageKey) -> PathBuf {
        self.path.join(key.relative_path(1))
    }

    pub async fn get(&self, key: &StorageKey) -> CacheResult<Option<Vec<u8>>> {
        let abspath = self.path_for(key);
        tracing::trace!("Fetching {} from {}", key, abspath.display());
        match fs::read(&abspath).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError::io(&abspath, err)),
        }
    }

    pub async fn put(&self, key: &StorageKey, data: &[u8]) -> CacheResult<StoreResult> {
        let abspath = self.path_for(key);
        let parent_dir = abspath.parent().unwrap_or(&self.path);
        fs::create_dir_all(parent_dir)
            .await
            .map_err(|e| CacheError::io(parent_dir, e))?;
        if fs::try_exists(&abspath).await.unwrap_or(false) {
            return Ok(StoreResult::Skipped);
        }

        let temp_file = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(parent_dir)
            .map_err(|e| CacheError::io(parent_dir, e))?;
        let guard = tmpfiles::register(temp_file.path());
        write_all(&temp_file, data)
            .await
            .map_err(|e| CacheError::io(temp_file.path(), e))?;

        temp_file
            .persist(&abspath)
            .map_err(|e| CacheError::io(&abspath, e.error))?;
        guard.keep();
        Ok(StoreResult::Written(data.len() as u64))
    }

    pub async fn contains(&self, key: &StorageKey) -> CacheResult<bool> {
        let abspath = self.path_for(key);
        fs::try_exists(&abspath)
            .await
            .map_err(|e| CacheError::io(&abspath, e))
    }
}

async fn write_all(temp_file: &NamedTempFile, data: &[u8]) -> io::Result<()> {
    let mut dest = File::from_std(temp_file.reopen()?);
    dest.write_all(data).await?;
    dest.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::Digest;

    #[tokio::test]
    async fn test_get_put_contains() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let key = StorageKey::manifest(Digest::of(b"manifest"));

        assert_eq!(backend.get(&key).await.unwrap(), None);
        assert!(!backend.contains(&key).await.unwrap());

        assert_eq!(
            backend.put(&key, b"content").await.unwrap(),
            StoreResult::Written(7)
        );
        assert_eq!(
            backend.put(&key, b"other content").await.unwrap(),
            StoreResult::Skipped
        );

        assert_eq!(backend.get(&key).await.unwrap().unwrap(), b"content");
        assert!(backend.contains(&key).await.unwrap());

        let hex = key.digest.to_hex();
        let expected = dir.path().join(&hex[..2]).join(format!("{}M", &hex[2..]));
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn test_put_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        for n in 0..8u8 {
            let key = StorageKey::result(Digest::of(&[n]));
            backend.put(&key, &[n; 64]).await.unwrap();
            assert!(backend.contains(&key).await.unwrap());
        }

        let leftovers: Vec<_> = walkdir::WalkDir::new(dir.path())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        assert!(
            tmpfiles::pending()
                .iter()
                .all(|path| !path.starts_with(dir.path()))
        );
    }
}
