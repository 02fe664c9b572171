use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetime::FileTime;

use super::lock::ShardLock;
use super::stats::{Counter, Counters, Statistics};
use super::{Shard, StorageKey, StoreResult};
use crate::config::Config;
use crate::error::{CacheError, CacheResult, catch_not_found};
use crate::utils::tmpfiles;

/// Prefix of temporary files inside the cache directory.
pub const TMP_PREFIX: &str = ".tmp";
pub(super) const STATS_FILE: &str = "stats";
pub(super) const LOCK_FILE: &str = "lock";

/// Size limits of the local cache.
///
/// A limit of `0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub max_size: u64,
    pub max_files: u64,
    /// Eviction shrinks the cache to this fraction of the limits.
    pub limit_multiple: f64,
}

impl Limits {
    pub fn unlimited() -> Self {
        Self {
            max_size: 0,
            max_files: 0,
            limit_multiple: 0.8,
        }
    }

    pub fn is_exceeded(&self, files: u64, size: u64) -> bool {
        (self.max_size != 0 && size > self.max_size)
            || (self.max_files != 0 && files > self.max_files)
    }

    /// The `(files, size)` eviction shrinks down to. Unlimited dimensions yield `u64::MAX`.
    pub fn low_water(&self) -> (u64, u64) {
        let scale = |limit: u64| match limit {
            0 => u64::MAX,
            limit => (limit as f64 * self.limit_multiple) as u64,
        };
        (scale(self.max_files), scale(self.max_size))
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// The primary storage backend: a sharded directory on the local disk.
///
/// Blobs are written to a temporary file in their destination directory and renamed into place,
/// so readers only ever see complete blobs. Each of the 256 shards carries a `stats` file and a
/// `lock` file; the lock guards every change to the stats file.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    pub(super) root: PathBuf,
    levels: usize,
    pub(super) limits: Limits,
    lock_timeout: Duration,
}

impl LocalStorage {
    /// Opens the cache directory at `root`, creating it if necessary.
    pub fn new(
        root: impl Into<PathBuf>,
        levels: usize,
        limits: Limits,
        lock_timeout: Duration,
    ) -> CacheResult<Self> {
        let root = root.into();
        if !(1..=4).contains(&levels) {
            return Err(CacheError::configuration(format!(
                "shard_levels must be between 1 and 4, got {levels}"
            )));
        }
        fs::create_dir_all(&root).map_err(|e| {
            CacheError::configuration(format!(
                "cache directory {} is not usable: {e}",
                root.display()
            ))
        })?;

        Ok(Self {
            root,
            levels,
            limits,
            lock_timeout,
        })
    }

    pub fn from_config(config: &Config) -> CacheResult<Self> {
        let limits = Limits {
            max_size: config.max_size,
            max_files: config.max_files,
            limit_multiple: config.limit_multiple,
        };
        Self::new(
            &config.cache_dir,
            config.shard_levels,
            limits,
            config.lock_timeout,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// The absolute path a key is stored at.
    pub fn path_for(&self, key: &StorageKey) -> PathBuf {
        self.root.join(key.relative_path(self.levels))
    }

    pub(super) fn shard_dir(&self, shard: Shard) -> PathBuf {
        self.root.join(shard.to_string())
    }

    pub(super) fn stats_path(&self, shard: Shard) -> PathBuf {
        self.shard_dir(shard).join(STATS_FILE)
    }

    pub(super) fn lock_shard(&self, shard: Shard) -> CacheResult<ShardLock> {
        let dir = self.shard_dir(shard);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        ShardLock::acquire(&dir.join(LOCK_FILE), self.lock_timeout)
    }

    /// Like [`lock_shard`](Self::lock_shard), but a lock timeout yields `None`.
    fn try_lock_shard(&self, shard: Shard) -> CacheResult<Option<ShardLock>> {
        match self.lock_shard(shard) {
            Ok(lock) => Ok(Some(lock)),
            Err(CacheError::LockTimeout(path)) => {
                tracing::warn!(
                    "could not lock {}, statistics update is deferred",
                    path.display()
                );
                metric!(counter("storage.local.lock_timeout") += 1);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Reads a blob and marks it as recently used.
    pub fn get(&self, key: &StorageKey) -> CacheResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let data = catch_not_found(|| fs::read(&path)).map_err(|e| CacheError::io(&path, e))?;

        if data.is_some() {
            touch(&path);
        }
        Ok(data)
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Atomically writes a blob.
    ///
    /// Writing a blob that is already stored with identical content only refreshes its mtime.
    /// Statistics deltas pending in `stats` for the same shard are written along with the blob's
    /// own accounting.
    pub fn put(
        &self,
        key: &StorageKey,
        data: &[u8],
        stats: &Statistics,
    ) -> CacheResult<StoreResult> {
        let path = self.path_for(key);
        if holds(&path, data) {
            touch(&path);
            return Ok(StoreResult::Skipped);
        }

        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;

        let mut temp = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(dir)
            .map_err(|e| CacheError::io(dir, e))?;
        let guard = tmpfiles::register(temp.path());
        temp.write_all(data)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| CacheError::io(temp.path(), e))?;

        let shard = key.shard();
        let totals = {
            let lock = self.try_lock_shard(shard)?;
            let previous = catch_not_found(|| fs::metadata(&path))
                .map_err(|e| CacheError::io(&path, e))?
                .map(|metadata| metadata.len());
            temp.persist(&path)
                .map_err(|e| CacheError::io(&path, e.error))?;
            guard.keep();

            let mut delta = Counters::default();
            match previous {
                Some(size) => delta.increment(Counter::CacheSizeBytes, -(size as i64)),
                None => delta.increment(Counter::FilesInCache, 1),
            }
            delta.increment(Counter::CacheSizeBytes, data.len() as i64);

            match lock {
                Some(_lock) => self.flush_locked(shard, delta, stats),
                None => {
                    stats.merge(shard, &delta);
                    None
                }
            }
        };

        metric!(time_raw("storage.local.put.size") = data.len() as u64);

        if let Some(totals) = totals {
            if let Err(error) = self.evict_if_over_limits(&totals, &path) {
                tracing::warn!("eviction after writing {} failed: {}", key, error);
            }
        }

        Ok(StoreResult::Written(data.len() as u64))
    }

    /// Deletes a blob. Returns `false` if there was nothing to delete.
    pub fn remove(&self, key: &StorageKey, stats: &Statistics) -> CacheResult<bool> {
        let path = self.path_for(key);
        let shard = key.shard();
        let lock = self.try_lock_shard(shard)?;

        let Some(metadata) =
            catch_not_found(|| fs::metadata(&path)).map_err(|e| CacheError::io(&path, e))?
        else {
            return Ok(false);
        };
        if catch_not_found(|| fs::remove_file(&path))
            .map_err(|e| CacheError::io(&path, e))?
            .is_none()
        {
            return Ok(false);
        }

        let mut delta = Counters::default();
        delta.increment(Counter::FilesInCache, -1);
        delta.increment(Counter::CacheSizeBytes, -(metadata.len() as i64));
        match lock {
            Some(_lock) => {
                self.flush_locked(shard, delta, stats);
            }
            None => stats.merge(shard, &delta),
        }
        Ok(true)
    }

    /// Writes all pending statistics of `stats` to the shard files.
    ///
    /// Failures are logged and otherwise ignored.
    pub fn flush_stats(&self, stats: &Statistics) {
        for (shard, delta) in stats.take_all() {
            match self.lock_shard(shard) {
                Ok(_lock) => {
                    self.flush_locked(shard, delta, stats);
                }
                Err(error) => {
                    tracing::warn!("dropping statistics of shard {}: {}", shard, error);
                }
            }
        }
    }

    /// Applies `f` to the counters of `shard` and writes them back.
    ///
    /// Must be called with the shard lock held.
    pub(super) fn update_counters_locked<F>(&self, shard: Shard, f: F) -> CacheResult<Counters>
    where
        F: FnOnce(&mut Counters),
    {
        let path = self.stats_path(shard);
        let mut counters = Counters::load(&path)?;
        f(&mut counters);
        counters.save(&path)?;
        Ok(counters)
    }

    /// Writes `delta` plus pending deltas of the shard. Returns the new totals on success.
    fn flush_locked(&self, shard: Shard, mut delta: Counters, stats: &Statistics) -> Option<Counters> {
        if let Some(pending) = stats.take(shard) {
            delta.merge(&pending);
        }
        if delta.is_zero() {
            return Counters::load(&self.stats_path(shard)).ok();
        }

        match self.update_counters_locked(shard, |counters| counters.merge(&delta)) {
            Ok(totals) => Some(totals),
            Err(error) => {
                tracing::warn!("failed to update statistics of shard {}: {}", shard, error);
                stats.merge(shard, &delta);
                None
            }
        }
    }
}

/// Returns `true` if the file at `path` has exactly the content `data`.
fn holds(path: &Path, data: &[u8]) -> bool {
    match fs::metadata(path) {
        Ok(metadata) if metadata.len() == data.len() as u64 => {
            fs::read(path).is_ok_and(|existing| existing == data)
        }
        _ => false,
    }
}

/// Marks a blob as recently used for eviction purposes.
fn touch(path: &Path) {
    if let Err(error) = filetime::set_file_mtime(path, FileTime::now()) {
        tracing::trace!("failed to touch {}: {}", path.display(), error);
    }
}
