//! The maintenance commands operating on the local cache directory.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use compcache_service::config::Config;
use compcache_service::storage::stats::Counter;
use compcache_service::storage::{CleanupStats, LocalStorage};
use compcache_service::utils::size::format_human_readable_size;

fn open(config: &Config) -> Result<LocalStorage> {
    LocalStorage::from_config(config).with_context(|| {
        format!(
            "failed to open cache directory {}",
            config.cache_dir.display()
        )
    })
}

fn report(out: &mut dyn Write, action: &str, stats: &CleanupStats) -> Result<()> {
    writeln!(
        out,
        "{action} {} files ({}), {} files ({}) remain",
        stats.removed_files,
        format_human_readable_size(stats.removed_bytes),
        stats.retained_files,
        format_human_readable_size(stats.retained_bytes),
    )?;
    Ok(())
}

pub fn show_stats(config: &Config, out: &mut dyn Write) -> Result<()> {
    let storage = open(config)?;
    let summary = storage.summary().context("failed to read statistics")?;
    writeln!(out, "{:<28}{}", "cache directory", storage.root().display())?;
    write!(out, "{summary}")?;
    Ok(())
}

pub fn zero_stats(config: &Config, out: &mut dyn Write) -> Result<()> {
    open(config)?
        .zero_stats()
        .context("failed to reset statistics")?;
    writeln!(out, "Statistics zeroed")?;
    Ok(())
}

/// Shrinks the cache to its configured limits and removes stray temporary files.
pub fn cleanup(config: &Config, out: &mut dyn Write) -> Result<()> {
    let stats = open(config)?
        .cleanup()
        .context("failed to clean up the cache")?;
    report(out, "Evicted", &stats)
}

pub fn clear(config: &Config, out: &mut dyn Write) -> Result<()> {
    let stats = open(config)?
        .clear()
        .context("failed to clear the cache")?;
    report(out, "Removed", &stats)
}

pub fn evict_older_than(config: &Config, max_age: Duration, out: &mut dyn Write) -> Result<()> {
    let stats = open(config)?
        .evict_older_than(max_age)
        .context("failed to evict old entries")?;
    report(out, "Evicted", &stats)
}

pub fn recount(config: &Config, out: &mut dyn Write) -> Result<()> {
    let storage = open(config)?;
    storage.recount().context("failed to recount the cache")?;
    let summary = storage.summary().context("failed to read statistics")?;
    writeln!(
        out,
        "Recounted {} files ({})",
        summary.counters.get(Counter::FilesInCache),
        format_human_readable_size(summary.counters.get(Counter::CacheSizeBytes).max(0) as u64),
    )?;
    Ok(())
}
