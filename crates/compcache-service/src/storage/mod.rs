//! Blob storage.
//!
//! A [`Storage`] chains the [`LocalStorage`] primary backend with any number of
//! [`Secondary`](remote::Secondary) backends:
//!
//! - `get` consults the primary first and then each readable secondary in configured order. A
//!   secondary hit is written to the primary before it is returned.
//! - `put` writes the primary and then every writable secondary.
//! - `remove` only affects the primary.
//!
//! Errors of the primary are fatal for the operation. Errors and timeouts of a secondary are
//! counted, logged and cause the secondary to be skipped for the rest of the process.

use crate::config::Config;
use crate::error::{CacheError, CacheResult};

mod cleanup;
pub mod format;
mod key;
mod local;
mod lock;
pub mod remote;
pub mod stats;

pub use cleanup::CleanupStats;
pub use format::Compression;
pub use key::{EntryKind, Shard, StorageKey};
pub use local::{Limits, LocalStorage, TMP_PREFIX};
pub use lock::ShardLock;

use remote::Secondary;
use stats::{Counter, Statistics, StatsSummary};

/// The result of an attempt to write a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    /// Successfully written as a new entry, contains the number of bytes written.
    Written(u64),
    /// Skipped writing the blob as it was already stored.
    Skipped,
}

impl AsRef<str> for StoreResult {
    fn as_ref(&self) -> &str {
        match self {
            StoreResult::Written(_) => "written",
            StoreResult::Skipped => "skipped",
        }
    }
}

/// The storage chain of a cache.
#[derive(Debug)]
pub struct Storage {
    primary: LocalStorage,
    secondaries: Vec<Secondary>,
    stats: Statistics,
}

impl Storage {
    pub fn new(primary: LocalStorage, secondaries: Vec<Secondary>) -> Self {
        Self {
            primary,
            secondaries,
            stats: Statistics::new(),
        }
    }

    pub fn from_config(config: &Config) -> CacheResult<Self> {
        let primary = LocalStorage::from_config(config)?;
        let secondaries = config
            .secondary_storage
            .iter()
            .map(Secondary::from_config)
            .collect::<CacheResult<_>>()?;
        Ok(Self::new(primary, secondaries))
    }

    pub fn primary(&self) -> &LocalStorage {
        &self.primary
    }

    pub fn secondaries(&self) -> &[Secondary] {
        &self.secondaries
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Records a statistics event for the shard of `key`.
    pub fn record(&self, key: &StorageKey, counter: Counter) {
        self.stats.record(key.shard(), counter, 1);
    }

    /// Reads a blob from the first backend that has it.
    pub async fn get(&self, key: &StorageKey) -> CacheResult<Option<Vec<u8>>> {
        if let Some(data) = self.primary.get(key)? {
            metric!(counter("storage.get") += 1, "backend" => "local", "kind" => key.kind.as_str());
            return Ok(Some(data));
        }

        for secondary in self.secondaries.iter().filter(|s| s.can_read()) {
            match secondary.get(key).await {
                Ok(Some(data)) => {
                    tracing::debug!("Found {} in secondary storage {}", key, secondary.url());
                    metric!(
                        counter("storage.get") += 1,
                        "backend" => secondary.name(),
                        "kind" => key.kind.as_str()
                    );
                    self.record(key, Counter::SecondaryHits);
                    self.primary.put(key, &data, &self.stats)?;
                    return Ok(Some(data));
                }
                Ok(None) => {}
                Err(error) => self.demote(secondary, key, error),
            }
        }

        Ok(None)
    }

    /// Writes a blob to the primary and all writable secondaries.
    pub async fn put(&self, key: &StorageKey, data: &[u8]) -> CacheResult<()> {
        let result = self.primary.put(key, data, &self.stats)?;
        metric!(counter("storage.put") += 1, "backend" => "local", "status" => result.as_ref());

        for secondary in self.secondaries.iter().filter(|s| s.can_write()) {
            match secondary.put(key, data).await {
                Ok(result) => {
                    metric!(
                        counter("storage.put") += 1,
                        "backend" => secondary.name(),
                        "status" => result.as_ref()
                    );
                }
                Err(error) => self.demote(secondary, key, error),
            }
        }
        Ok(())
    }

    /// Removes a blob from the primary. Secondaries are never modified.
    pub fn remove(&self, key: &StorageKey) -> CacheResult<bool> {
        self.primary.remove(key, &self.stats)
    }

    /// Removes a blob that failed to decode.
    pub fn remove_corrupt(&self, key: &StorageKey, error: &CacheError) {
        tracing::warn!("removing corrupt {} {}: {}", key.kind, key, error);
        metric!(counter("storage.corrupt") += 1, "kind" => key.kind.as_str());
        self.record(key, Counter::CorruptEntries);
        if let Err(error) = self.remove(key) {
            tracing::warn!("failed to remove corrupt entry {}: {}", key, error);
        }
    }

    pub async fn contains(&self, key: &StorageKey) -> CacheResult<bool> {
        if self.primary.contains(key) {
            return Ok(true);
        }
        for secondary in self.secondaries.iter().filter(|s| s.can_read()) {
            match secondary.contains(key).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(error) => self.demote(secondary, key, error),
            }
        }
        Ok(false)
    }

    /// Writes statistics recorded by this process to the primary.
    pub fn flush_stats(&self) {
        self.primary.flush_stats(&self.stats);
    }

    /// Statistics of the primary, including events not yet flushed.
    pub fn summary(&self) -> CacheResult<StatsSummary> {
        let mut summary = self.primary.summary()?;
        summary.counters.merge(&self.stats.pending_totals());
        Ok(summary)
    }

    fn demote(&self, secondary: &Secondary, key: &StorageKey, error: CacheError) {
        let event = match error {
            CacheError::Timeout(_) => Counter::SecondaryTimeouts,
            _ => Counter::SecondaryErrors,
        };
        tracing::warn!("secondary storage {} failed: {}", secondary.url(), error);
        metric!(
            counter("storage.secondary.error") += 1,
            "backend" => secondary.name(),
            "error" => event.name()
        );
        self.record(key, event);
        secondary.mark_unavailable();
    }
}
