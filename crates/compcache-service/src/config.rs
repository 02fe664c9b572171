use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::error::{CacheError, CacheResult};
use crate::storage::Compression;
use crate::storage::remote::SecondaryStorageConfig;
use crate::utils::size::parse_size;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::WARN,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "compcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Relaxations of the checks that guard against wrong cache hits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Sloppiness {
    /// Cache sources that use `__DATE__`, `__TIME__` or `__TIMESTAMP__` in direct mode.
    pub time_macros: bool,
    /// Record headers in manifests even if they were modified during the compilation.
    pub include_file_mtime: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SloppinessFlag {
    TimeMacros,
    IncludeFileMtime,
}

impl<'de> Deserialize<'de> for Sloppiness {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let flags = Vec::<SloppinessFlag>::deserialize(deserializer)?;
        let mut sloppiness = Sloppiness::default();
        for flag in flags {
            match flag {
                SloppinessFlag::TimeMacros => sloppiness.time_macros = true,
                SloppinessFlag::IncludeFileMtime => sloppiness.include_file_mtime = true,
            }
        }
        Ok(sloppiness)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The primary cache directory.
    pub cache_dir: PathBuf,

    /// Maximum size of the primary cache, e.g. `"5G"`. `0` disables the limit.
    #[serde(deserialize_with = "deserialize_size")]
    pub max_size: u64,

    /// Maximum number of blobs in the primary cache. `0` disables the limit.
    pub max_files: u64,

    /// Eviction shrinks the cache to this fraction of its limits.
    pub limit_multiple: f64,

    /// Number of two-character directory levels blobs are nested in.
    pub shard_levels: usize,

    /// Whether to look up results through manifests before preprocessing.
    pub direct_mode: bool,

    /// Maximum number of header sets remembered per manifest.
    pub max_manifest_candidates: usize,

    /// Headers under these paths are not recorded in manifests.
    pub ignore_headers_in_manifest: Vec<PathBuf>,

    /// Compiler options that are not hashed. A trailing `*` matches any suffix.
    pub ignore_options: Vec<String>,

    pub sloppiness: Sloppiness,

    /// Whether to zstd-compress blobs.
    pub compression: bool,

    pub compression_level: i32,

    /// Whether failed compilations are cached as well.
    pub cache_failed_compilations: bool,

    /// Umask applied while the cache writes files, as an octal string like `"002"`.
    #[serde(deserialize_with = "deserialize_umask")]
    pub umask: Option<u32>,

    /// How long to wait for a shard lock.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    pub secondary_storage: Vec<SecondaryStorageConfig>,

    pub logging: Logging,

    pub metrics: Metrics,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("compcache"))
        .unwrap_or_else(|| PathBuf::from(".compcache"))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            max_size: 5 * 1000 * 1000 * 1000,
            max_files: 0,
            limit_multiple: 0.8,
            shard_levels: 2,
            direct_mode: true,
            max_manifest_candidates: 100,
            ignore_headers_in_manifest: Vec::new(),
            ignore_options: Vec::new(),
            sloppiness: Sloppiness::default(),
            compression: true,
            compression_level: 1,
            cache_failed_compilations: false,
            umask: None,
            lock_timeout: Duration::from_secs(2),
            secondary_storage: Vec::new(),
            logging: Logging::default(),
            metrics: Metrics::default(),
        }
    }
}

impl Config {
    /// Loads the configuration file at `path`, or the defaults if there is none.
    pub fn get(path: Option<&Path>) -> CacheResult<Self> {
        let config = match path {
            Some(path) => {
                let file = fs::File::open(path).map_err(|e| {
                    CacheError::configuration(format!(
                        "failed to open configuration file {}: {e}",
                        path.display()
                    ))
                })?;
                Self::from_reader(file)?
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn from_reader(mut reader: impl std::io::Read) -> CacheResult<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .map_err(|e| CacheError::configuration(format!("failed reading config file: {e}")))?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            return Err(CacheError::configuration("config file empty"));
        }
        serde_yaml::from_str(&config)
            .map_err(|e| CacheError::configuration(format!("failed to parse config YAML: {e}")))
    }

    /// The compression applied to newly written blobs.
    pub fn compression(&self) -> Compression {
        if self.compression {
            Compression::Zstd(self.compression_level)
        } else {
            Compression::None
        }
    }

    /// Checks value ranges that the YAML types cannot express.
    pub fn validate(&self) -> CacheResult<()> {
        if !(1..=4).contains(&self.shard_levels) {
            return Err(CacheError::configuration(format!(
                "shard_levels must be between 1 and 4, got {}",
                self.shard_levels
            )));
        }
        if !(self.limit_multiple > 0.0 && self.limit_multiple <= 1.0) {
            return Err(CacheError::configuration(format!(
                "limit_multiple must be in (0, 1], got {}",
                self.limit_multiple
            )));
        }
        if self.max_manifest_candidates == 0 {
            return Err(CacheError::configuration(
                "max_manifest_candidates must be at least 1",
            ));
        }
        if !(-7..=22).contains(&self.compression_level) {
            return Err(CacheError::configuration(format!(
                "compression_level must be between -7 and 22, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// Accepts a string like `"5G"` or a plain number, which is read the same way as a string.
fn deserialize_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }

    let text = match Size::deserialize(deserializer)? {
        Size::Number(number) => number.to_string(),
        Size::Text(text) => text,
    };
    parse_size(&text).map_err(de::Error::custom)
}

fn deserialize_umask<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Umask {
        Number(u32),
        Text(String),
    }

    let text = match Option::<Umask>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Umask::Number(number)) => number.to_string(),
        Some(Umask::Text(text)) => text,
    };
    match u32::from_str_radix(&text, 8) {
        Ok(mask) if mask <= 0o777 => Ok(Some(mask)),
        _ => Err(de::Error::custom(format!("invalid umask: {text:?}"))),
    }
}

struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        v.parse()
            .map_err(|_| de::Error::unknown_variant(v, &["off", "error", "warn", "info", "debug", "trace"]))
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
