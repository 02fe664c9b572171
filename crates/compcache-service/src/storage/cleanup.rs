//! Eviction and maintenance of the local cache directory.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rayon::prelude::*;

use super::local::{LOCK_FILE, Limits, LocalStorage, STATS_FILE, TMP_PREFIX};
use super::stats::{Counter, Counters, StatsSummary};
use super::Shard;
use crate::error::CacheResult;

/// Temporary files older than this are left over by crashed processes.
const STRAY_TMP_AGE: Duration = Duration::from_secs(3600);

/// Statistics of a cleanup run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: u64,
    pub removed_bytes: u64,
    pub retained_files: u64,
    pub retained_bytes: u64,
}

impl AddAssign for CleanupStats {
    fn add_assign(&mut self, rhs: Self) {
        self.removed_files += rhs.removed_files;
        self.removed_bytes += rhs.removed_bytes;
        self.retained_files += rhs.retained_files;
        self.retained_bytes += rhs.retained_bytes;
    }
}

/// A blob found while scanning the cache directory.
#[derive(Debug, Clone)]
struct BlobFile {
    path: PathBuf,
    shard: Shard,
    size: u64,
    mtime: SystemTime,
}

/// Sorts `files` by last use and splits off the least recently used ones until the rest fits into
/// the low-water mark of `limits`. Returns the victims, oldest first.
///
/// The blob at `protect` is never selected, though its size counts towards the totals.
fn select_victims(
    files: &mut Vec<BlobFile>,
    limits: &Limits,
    protect: Option<&Path>,
) -> Vec<BlobFile> {
    let mut total_files = files.len() as u64;
    let mut total_size: u64 = files.iter().map(|file| file.size).sum();
    if !limits.is_exceeded(total_files, total_size) {
        return Vec::new();
    }

    files.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.path.cmp(&b.path)));

    let (low_files, low_size) = limits.low_water();
    let mut victims = Vec::new();
    let mut retained = Vec::with_capacity(files.len());
    for file in files.drain(..) {
        let fits = total_files <= low_files && total_size <= low_size;
        if fits || protect == Some(file.path.as_path()) {
            retained.push(file);
            continue;
        }
        total_files -= 1;
        total_size -= file.size;
        victims.push(file);
    }
    *files = retained;
    victims
}

fn is_blob_name(name: &str) -> bool {
    name != STATS_FILE && name != LOCK_FILE && !name.starts_with(TMP_PREFIX)
}

impl LocalStorage {
    fn scan_shard(&self, shard: Shard) -> Vec<BlobFile> {
        let dir = self.shard_dir(shard);
        if !dir.is_dir() {
            return Vec::new();
        }

        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::debug!("skipping unreadable entry in {}: {}", dir.display(), error);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_blob_name(&entry.file_name().to_string_lossy())
            {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            files.push(BlobFile {
                path: entry.into_path(),
                shard,
                size: metadata.len(),
                mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        files
    }

    fn scan_all(&self) -> Vec<BlobFile> {
        let shards: Vec<_> = Shard::all().collect();
        shards
            .into_par_iter()
            .flat_map_iter(|shard| self.scan_shard(shard))
            .collect()
    }

    /// Deletes `files`, which must all belong to `shard`, and returns the statistics delta.
    ///
    /// Must be called with the shard lock held.
    fn remove_locked(&self, files: &[BlobFile]) -> (CleanupStats, Counters) {
        let mut stats = CleanupStats::default();
        let mut delta = Counters::default();
        for file in files {
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    tracing::trace!("removing {}", file.path.display());
                    stats.removed_files += 1;
                    stats.removed_bytes += file.size;
                    delta.increment(Counter::FilesInCache, -1);
                    delta.increment(Counter::CacheSizeBytes, -(file.size as i64));
                }
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::warn!("failed to remove {}: {}", file.path.display(), error);
                }
            }
        }
        (stats, delta)
    }

    /// Removes `files`, grouped by shard, and accounts for them in the shard statistics.
    fn remove_files(&self, files: Vec<BlobFile>, evicted: bool) -> CleanupStats {
        let mut by_shard: BTreeMap<Shard, Vec<BlobFile>> = BTreeMap::new();
        for file in files {
            by_shard.entry(file.shard).or_default().push(file);
        }

        let mut total = CleanupStats::default();
        for (shard, files) in by_shard {
            let _lock = match self.lock_shard(shard) {
                Ok(lock) => lock,
                Err(error) => {
                    tracing::warn!("skipping shard {}: {}", shard, error);
                    continue;
                }
            };

            let (stats, mut delta) = self.remove_locked(&files);
            if evicted {
                delta.increment(Counter::EvictedFiles, stats.removed_files as i64);
                delta.increment(Counter::CleanupsPerformed, 1);
            }
            if let Err(error) = self.update_counters_locked(shard, |c| c.merge(&delta)) {
                tracing::warn!("failed to update statistics of shard {}: {}", shard, error);
            }
            total += stats;
        }
        total
    }

    /// Checks the cache totals after a write to `shard` and evicts if they exceed the limits.
    ///
    /// `shard_totals` are the counters of the written shard. Only when this shard, scaled to the
    /// whole cache, would exceed the limits are the other stats files read, so the common case
    /// stays cheap. The blob at `written` survives the eviction.
    pub(super) fn evict_if_over_limits(
        &self,
        shard_totals: &Counters,
        written: &Path,
    ) -> CacheResult<CleanupStats> {
        let shards = Shard::COUNT as u64;
        let shard_files = shard_totals.get(Counter::FilesInCache).max(0) as u64;
        let shard_size = shard_totals.get(Counter::CacheSizeBytes).max(0) as u64;
        if !self.limits.is_exceeded(
            shard_files.saturating_mul(shards),
            shard_size.saturating_mul(shards),
        ) {
            return Ok(CleanupStats::default());
        }

        let totals = self.summary()?.counters;
        let files = totals.get(Counter::FilesInCache).max(0) as u64;
        let size = totals.get(Counter::CacheSizeBytes).max(0) as u64;
        if !self.limits.is_exceeded(files, size) {
            return Ok(CleanupStats::default());
        }

        tracing::debug!("cache holds {} files ({} bytes), evicting", files, size);
        self.evict_to_limits(Some(written))
    }

    /// Removes least recently used blobs across all shards until the cache is below the
    /// low-water mark of its limits.
    fn evict_to_limits(&self, protect: Option<&Path>) -> CacheResult<CleanupStats> {
        let mut files = self.scan_all();
        let victims = select_victims(&mut files, &self.limits, protect);
        let mut stats = self.remove_files(victims, true);
        stats.retained_files = files.len() as u64;
        stats.retained_bytes = files.iter().map(|file| file.size).sum();

        if stats.removed_files > 0 {
            tracing::debug!(
                "evicted {} files ({} bytes)",
                stats.removed_files,
                stats.removed_bytes
            );
            metric!(counter("storage.local.evicted") += stats.removed_files as i64);
        }
        Ok(stats)
    }

    /// Brings the whole cache below the low-water mark of its limits.
    ///
    /// Stray temporary files are removed and the statistics recounted as well.
    pub fn cleanup(&self) -> CacheResult<CleanupStats> {
        tracing::info!("Cleaning up cache: {}", self.root.display());
        self.remove_stray_temp_files(STRAY_TMP_AGE);

        let stats = self.evict_to_limits(None)?;
        self.recount()?;

        tracing::info!(
            "Removed {} files ({} bytes), retained {} files ({} bytes)",
            stats.removed_files,
            stats.removed_bytes,
            stats.retained_files,
            stats.retained_bytes
        );
        Ok(stats)
    }

    /// Removes all blobs that were not used within `max_age`.
    pub fn evict_older_than(&self, max_age: Duration) -> CacheResult<CleanupStats> {
        let threshold = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let (victims, retained): (Vec<_>, Vec<_>) = self
            .scan_all()
            .into_iter()
            .partition(|file| file.mtime < threshold);

        let mut stats = self.remove_files(victims, true);
        stats.retained_files = retained.len() as u64;
        stats.retained_bytes = retained.iter().map(|file| file.size).sum();
        self.recount()?;
        Ok(stats)
    }

    /// Removes all blobs. Statistics other than the content counters are kept.
    pub fn clear(&self) -> CacheResult<CleanupStats> {
        self.remove_stray_temp_files(Duration::ZERO);
        let stats = self.remove_files(self.scan_all(), false);
        self.recount()?;
        Ok(stats)
    }

    /// Recomputes the content counters of every shard from the directory content.
    pub fn recount(&self) -> CacheResult<()> {
        for shard in Shard::all() {
            let dir = self.shard_dir(shard);
            if !dir.is_dir() {
                continue;
            }

            let _lock = self.lock_shard(shard)?;
            let files = self.scan_shard(shard);
            let size: u64 = files.iter().map(|file| file.size).sum();
            self.update_counters_locked(shard, |counters| {
                counters.set(Counter::FilesInCache, files.len() as i64);
                counters.set(Counter::CacheSizeBytes, size as i64);
            })?;
        }
        Ok(())
    }

    /// Resets all event counters to zero, keeping the content counters.
    pub fn zero_stats(&self) -> CacheResult<()> {
        for shard in Shard::all() {
            if !self.stats_path(shard).is_file() {
                continue;
            }

            let _lock = self.lock_shard(shard)?;
            self.update_counters_locked(shard, |counters| {
                for counter in Counter::ALL {
                    if !counter.is_content() {
                        counters.set(counter, 0);
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Sums the statistics of all shards.
    ///
    /// This reads the stats files without locking, so the numbers may be slightly out of date
    /// while other processes are writing.
    pub fn summary(&self) -> CacheResult<StatsSummary> {
        let mut counters = Counters::default();
        for shard in Shard::all() {
            counters.merge(&Counters::load(&self.stats_path(shard))?);
        }
        Ok(StatsSummary {
            counters,
            max_size: self.limits.max_size,
            max_files: self.limits.max_files,
        })
    }

    /// Deletes temporary files older than `max_age`. Returns how many were removed.
    pub fn remove_stray_temp_files(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.file_name().to_string_lossy().starts_with(TMP_PREFIX)
            })
            .filter(|entry| {
                entry
                    .metadata()
                    .ok()
                    .and_then(|metadata| metadata.modified().ok())
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .is_some_and(|age| age >= max_age)
            })
            .filter(|entry| fs::remove_file(entry.path()).is_ok())
            .count()
    }
}
