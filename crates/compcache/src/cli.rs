//! Exposes the command line application.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use compcache_service::config::Config;
use compcache_service::metrics;
use compcache_service::utils::size::parse_duration;
use compcache_service::utils::tmpfiles;

use crate::logging;
use crate::maintenance;

/// compcache commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Print the cache statistics.
    ShowStats,

    /// Reset the event counters, keeping the content counters.
    ZeroStats,

    /// Evict least recently used entries until the cache fits its limits.
    Cleanup,

    /// Remove all cache entries.
    Clear,

    /// Remove all entries that were not used within the given age, e.g. `2d` or `3600s`.
    EvictOlderThan {
        #[arg(value_parser = parse_duration)]
        age: Duration,
    },

    /// Recompute the file and size counters from the directory content.
    Recount,
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(bin_name = "compcache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    logging::init_logging(&config);
    if let Some(ref statsd) = config.metrics.statsd {
        if let Err(error) = metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        ) {
            tracing::warn!("failed to configure statsd: {}", error);
        }
    }
    if let Err(error) = tmpfiles::install_termination_handler() {
        tracing::debug!("could not install termination handler: {}", error);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run(&config, cli.command, &mut out)?;
    out.flush()?;
    Ok(())
}

fn run(config: &Config, command: Command, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::ShowStats => {
            maintenance::show_stats(config, out).context("failed to show statistics")
        }
        Command::ZeroStats => maintenance::zero_stats(config, out),
        Command::Cleanup => maintenance::cleanup(config, out).context("failed to clean up cache"),
        Command::Clear => maintenance::clear(config, out),
        Command::EvictOlderThan { age } => maintenance::evict_older_than(config, age, out),
        Command::Recount => maintenance::recount(config, out),
    }
}
