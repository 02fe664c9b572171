//! Cache statistics.
//!
//! Counters are persisted per shard in a small JSON file next to the blobs:
//!
//! ```json
//! {"version": 1, "counters": {"direct_hit": 3, "files_in_cache": 12}}
//! ```
//!
//! Unknown counter names are ignored when reading, so older binaries can read files written by
//! newer ones. Files are only ever written while the shard lock is held.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::Shard;
use super::local::TMP_PREFIX;
use crate::error::{CacheError, CacheResult, catch_not_found};
use crate::utils::tmpfiles;
use crate::utils::size::format_human_readable_size;

const STATS_VERSION: u32 = 1;

/// A single statistics counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Counter {
    DirectHit,
    PreprocessedHit,
    Miss,
    CompileFailed,
    Uncacheable,
    FilesInCache,
    CacheSizeBytes,
    CorruptEntries,
    SecondaryHits,
    SecondaryErrors,
    SecondaryTimeouts,
    CleanupsPerformed,
    EvictedFiles,
}

impl Counter {
    pub const COUNT: usize = 13;

    pub const ALL: [Counter; Self::COUNT] = [
        Counter::DirectHit,
        Counter::PreprocessedHit,
        Counter::Miss,
        Counter::CompileFailed,
        Counter::Uncacheable,
        Counter::FilesInCache,
        Counter::CacheSizeBytes,
        Counter::CorruptEntries,
        Counter::SecondaryHits,
        Counter::SecondaryErrors,
        Counter::SecondaryTimeouts,
        Counter::CleanupsPerformed,
        Counter::EvictedFiles,
    ];

    /// The name under which the counter is persisted.
    pub fn name(self) -> &'static str {
        match self {
            Counter::DirectHit => "direct_hit",
            Counter::PreprocessedHit => "preprocessed_hit",
            Counter::Miss => "miss",
            Counter::CompileFailed => "compile_failed",
            Counter::Uncacheable => "uncacheable",
            Counter::FilesInCache => "files_in_cache",
            Counter::CacheSizeBytes => "cache_size_bytes",
            Counter::CorruptEntries => "corrupt_entries",
            Counter::SecondaryHits => "secondary_hits",
            Counter::SecondaryErrors => "secondary_errors",
            Counter::SecondaryTimeouts => "secondary_timeouts",
            Counter::CleanupsPerformed => "cleanups_performed",
            Counter::EvictedFiles => "evicted_files",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|counter| counter.name() == name)
    }

    /// Whether the counter describes the cache content rather than events.
    ///
    /// Zeroing statistics keeps these.
    pub fn is_content(self) -> bool {
        matches!(self, Counter::FilesInCache | Counter::CacheSizeBytes)
    }
}

/// A value for every [`Counter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters([i64; Counter::COUNT]);

impl Counters {
    pub fn get(&self, counter: Counter) -> i64 {
        self.0[counter as usize]
    }

    pub fn set(&mut self, counter: Counter, value: i64) {
        self.0[counter as usize] = value;
    }

    pub fn increment(&mut self, counter: Counter, delta: i64) {
        self.0[counter as usize] += delta;
    }

    pub fn merge(&mut self, other: &Counters) {
        for (value, delta) in self.0.iter_mut().zip(other.0) {
            *value += delta;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|value| *value == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, i64)> + '_ {
        Counter::ALL.into_iter().map(|counter| (counter, self.get(counter)))
    }

    /// Reads counters from a stats file. A missing file reads as all zeros.
    pub fn load(path: &Path) -> CacheResult<Self> {
        let Some(data) = catch_not_found(|| fs::read(path)).map_err(|e| CacheError::io(path, e))?
        else {
            return Ok(Self::default());
        };

        let file: StatsFile = match serde_json::from_slice(&data) {
            Ok(file) => file,
            Err(error) => {
                tracing::warn!("ignoring unreadable stats file {}: {}", path.display(), error);
                return Ok(Self::default());
            }
        };

        let mut counters = Self::default();
        for (name, value) in file.counters {
            if let Some(counter) = Counter::from_name(&name) {
                counters.set(counter, value);
            }
        }
        Ok(counters)
    }

    /// Writes counters to a stats file, replacing it atomically.
    pub fn save(&self, path: &Path) -> CacheResult<()> {
        let file = StatsFile {
            version: STATS_VERSION,
            counters: self
                .iter()
                .map(|(counter, value)| (counter.name().to_owned(), value))
                .collect(),
        };
        let data = serde_json::to_vec(&file).map_err(|e| CacheError::io(path, e.into()))?;

        let dir = path
            .parent()
            .ok_or_else(|| CacheError::configuration("stats file has no parent directory"))?;
        let mut temp = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(dir)
            .map_err(|e| CacheError::io(dir, e))?;
        let guard = tmpfiles::register(temp.path());
        temp.write_all(&data).map_err(|e| CacheError::io(temp.path(), e))?;
        temp.persist(path).map_err(|e| CacheError::io(path, e.error))?;
        guard.keep();
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StatsFile {
    version: u32,
    #[serde(default)]
    counters: BTreeMap<String, i64>,
}

/// Statistics recorded by this process that have not been written yet.
///
/// Updates are cheap and in-memory. They are merged into the per-shard stats files whenever the
/// storage holds the shard lock anyway, and at the end of every lookup.
#[derive(Debug, Default)]
pub struct Statistics {
    pending: Mutex<BTreeMap<Shard, Counters>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, shard: Shard, counter: Counter, delta: i64) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.entry(shard).or_default().increment(counter, delta);
    }

    /// Adds a full set of deltas, e.g. ones that could not be written earlier.
    pub fn merge(&self, shard: Shard, delta: &Counters) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.entry(shard).or_default().merge(delta);
    }

    /// Removes and returns the pending deltas of one shard.
    pub fn take(&self, shard: Shard) -> Option<Counters> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.remove(&shard)
    }

    /// Removes and returns all pending deltas.
    pub fn take_all(&self) -> BTreeMap<Shard, Counters> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *pending)
    }

    /// Sums the pending deltas over all shards.
    pub fn pending_totals(&self) -> Counters {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut totals = Counters::default();
        for counters in pending.values() {
            totals.merge(counters);
        }
        totals
    }
}

/// Aggregated statistics as shown to users.
#[derive(Debug, Clone)]
pub struct StatsSummary {
    pub counters: Counters,
    pub max_size: u64,
    pub max_files: u64,
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        let hits = c.get(Counter::DirectHit) + c.get(Counter::PreprocessedHit);
        let total = hits + c.get(Counter::Miss);

        writeln!(f, "{:<28}{:>12}", "cache hit (direct)", c.get(Counter::DirectHit))?;
        writeln!(
            f,
            "{:<28}{:>12}",
            "cache hit (preprocessed)",
            c.get(Counter::PreprocessedHit)
        )?;
        writeln!(f, "{:<28}{:>12}", "cache miss", c.get(Counter::Miss))?;
        if total > 0 {
            let rate = hits as f64 * 100.0 / total as f64;
            writeln!(f, "{:<28}{:>11.2}%", "cache hit rate", rate)?;
        }
        writeln!(
            f,
            "{:<28}{:>12}",
            "compile failed",
            c.get(Counter::CompileFailed)
        )?;
        writeln!(f, "{:<28}{:>12}", "uncacheable", c.get(Counter::Uncacheable))?;
        writeln!(
            f,
            "{:<28}{:>12}",
            "corrupt entries",
            c.get(Counter::CorruptEntries)
        )?;
        writeln!(
            f,
            "{:<28}{:>12}",
            "secondary storage hits",
            c.get(Counter::SecondaryHits)
        )?;
        writeln!(
            f,
            "{:<28}{:>12}",
            "secondary storage errors",
            c.get(Counter::SecondaryErrors)
        )?;
        writeln!(
            f,
            "{:<28}{:>12}",
            "secondary storage timeouts",
            c.get(Counter::SecondaryTimeouts)
        )?;
        writeln!(
            f,
            "{:<28}{:>12}",
            "cleanups performed",
            c.get(Counter::CleanupsPerformed)
        )?;
        writeln!(f, "{:<28}{:>12}", "evicted files", c.get(Counter::EvictedFiles))?;
        writeln!(
            f,
            "{:<28}{:>12}",
            "files in cache",
            c.get(Counter::FilesInCache)
        )?;
        let size = c.get(Counter::CacheSizeBytes).max(0) as u64;
        writeln!(
            f,
            "{:<28}{:>12}",
            "cache size",
            format_human_readable_size(size)
        )?;
        if self.max_files != 0 {
            writeln!(f, "{:<28}{:>12}", "max files", self.max_files)?;
        }
        if self.max_size != 0 {
            writeln!(
                f,
                "{:<28}{:>12}",
                "max cache size",
                format_human_readable_size(self.max_size)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_names_roundtrip() {
        for counter in Counter::ALL {
            assert_eq!(Counter::from_name(counter.name()), Some(counter));
        }
        assert_eq!(Counter::from_name("bogus"), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats");

        assert!(Counters::load(&path).unwrap().is_zero());

        let mut counters = Counters::default();
        counters.increment(Counter::DirectHit, 3);
        counters.increment(Counter::CacheSizeBytes, 1024);
        counters.save(&path).unwrap();

        assert_eq!(Counters::load(&path).unwrap(), counters);

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, ["stats"]);
        assert!(
            tmpfiles::pending()
                .iter()
                .all(|pending| !pending.starts_with(dir.path()))
        );
    }

    #[test]
    fn test_load_is_forward_compatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats");
        std::fs::write(
            &path,
            r#"{"version": 7, "counters": {"miss": 5, "counted_by_the_future": 9}, "extra": true}"#,
        )
        .unwrap();

        let counters = Counters::load(&path).unwrap();
        assert_eq!(counters.get(Counter::Miss), 5);
        assert_eq!(counters.iter().map(|(_, value)| value).sum::<i64>(), 5);
    }

    #[test]
    fn test_load_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats");
        std::fs::write(&path, b"\0\0garbage").unwrap();
        assert!(Counters::load(&path).unwrap().is_zero());
    }

    #[test]
    fn test_pending_statistics() {
        let stats = Statistics::new();
        stats.record(Shard::new(0x0a), Counter::Miss, 1);
        stats.record(Shard::new(0x0a), Counter::Miss, 1);
        stats.record(Shard::new(0xff), Counter::DirectHit, 1);

        assert_eq!(stats.pending_totals().get(Counter::Miss), 2);
        assert_eq!(stats.take(Shard::new(0x0a)).unwrap().get(Counter::Miss), 2);
        assert!(stats.take(Shard::new(0x0a)).is_none());

        let rest = stats.take_all();
        assert_eq!(rest.len(), 1);
        assert!(stats.take_all().is_empty());
    }

    #[test]
    fn test_summary_display() {
        let mut counters = Counters::default();
        counters.set(Counter::DirectHit, 6);
        counters.set(Counter::PreprocessedHit, 2);
        counters.set(Counter::Miss, 2);
        counters.set(Counter::FilesInCache, 12);
        counters.set(Counter::CacheSizeBytes, 1_234_000);
        let summary = StatsSummary {
            counters,
            max_size: 5_000_000_000,
            max_files: 0,
        };

        insta::assert_snapshot!(summary, @r###"
        cache hit (direct)                     6
        cache hit (preprocessed)               2
        cache miss                             2
        cache hit rate                    80.00%
        compile failed                         0
        uncacheable                            0
        corrupt entries                        0
        secondary storage hits                 0
        secondary storage errors               0
        secondary storage timeouts             0
        cleanups performed                     0
        evicted files                          0
        files in cache                        12
        cache size                        1.2 MB
        max cache size                    5.0 GB
        "###);
    }
}
