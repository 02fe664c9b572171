//! The end-to-end cache lookup for one compiler invocation.
//!
//! A lookup first tries *direct mode*: the source file is hashed without preprocessing and the
//! manifest for it names candidate results, each guarded by the digests of the headers it was
//! compiled with. If no candidate is valid, the lookup falls back to *preprocessor mode* and looks
//! the result up by the digest of the preprocessed source. On a miss the compiler runs and its
//! result is stored under both keys, and the manifest learns about the headers that were included.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use futures::future::BoxFuture;
use thiserror::Error;

use crate::config::{Config, Sloppiness};
use crate::error::{CacheError, CacheResult};
use crate::hashing::{Digest, FileResolver, InodeCache, contains_temporal_macros};
use crate::key::{
    ArgFilter, CommonHashInputs, CommonHashInputsBuilder, direct_result_key, manifest_key,
    preprocessed_result_key,
};
use crate::manifest::{HeaderEntry, Manifest, hash_headers};
use crate::result::{FileKind, ResultEntry, ResultStore};
use crate::storage::stats::Counter;
use crate::storage::{Compression, Storage, StorageKey};
use crate::utils::paths::matches_dir_prefix_or_file;

/// The output of the preprocessor.
#[derive(Debug, Clone, Default)]
pub struct Preprocessed {
    /// The preprocessed source.
    pub output: Vec<u8>,
    /// Every header that was included, directly or transitively.
    pub included_headers: Vec<PathBuf>,
}

/// The output of a compiler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilerOutput {
    pub exit_status: i32,
    pub object: Option<Vec<u8>>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub dependency_file: Option<Vec<u8>>,
}

/// Runs the preprocessor and the compiler for one invocation.
pub trait Compilation: Sync {
    /// The source file being compiled.
    fn source_path(&self) -> &Path;

    fn preprocess(&self) -> BoxFuture<'_, anyhow::Result<Preprocessed>>;

    fn compile(&self) -> BoxFuture<'_, anyhow::Result<CompilerOutput>>;
}

/// An error that ends a lookup.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The cache itself failed. Callers may compile without caching.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Running the preprocessor or the compiler failed.
    #[error("compilation failed: {0:#}")]
    Compiler(anyhow::Error),
}

/// How a lookup was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    DirectHit,
    PreprocessedHit,
    /// The compiler ran and its result was stored.
    Miss,
    /// The compiler ran, but its result cannot be stored.
    Uncacheable,
}

impl AsRef<str> for Verdict {
    fn as_ref(&self) -> &str {
        match self {
            Verdict::DirectHit => "direct_hit",
            Verdict::PreprocessedHit => "preprocessed_hit",
            Verdict::Miss => "miss",
            Verdict::Uncacheable => "uncacheable",
        }
    }
}

/// The answer to a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub verdict: Verdict,
    pub result: ResultEntry,
}

impl Outcome {
    pub fn is_hit(&self) -> bool {
        matches!(self.verdict, Verdict::DirectHit | Verdict::PreprocessedHit)
    }

    /// Reproduces the compilation: writes the object and dependency files and the captured output.
    ///
    /// Returns the exit status of the compilation.
    pub fn replay(
        &self,
        object_path: &Path,
        dependency_path: Option<&Path>,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> io::Result<i32> {
        if let Some(object) = self.result.file(FileKind::Object) {
            fs::write(object_path, object)?;
        }
        if let (Some(path), Some(dependency_file)) =
            (dependency_path, self.result.file(FileKind::Dependency))
        {
            fs::write(path, dependency_file)?;
        }
        if let Some(data) = self.result.file(FileKind::Stdout) {
            stdout.write_all(data)?;
        }
        if let Some(data) = self.result.file(FileKind::Stderr) {
            stderr.write_all(data)?;
        }
        Ok(self.result.exit_status)
    }
}

/// Settings that shape a lookup.
#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub direct_mode: bool,
    pub sloppiness: Sloppiness,
    pub max_manifest_candidates: usize,
    /// Headers under these directories, or these exact files, are not recorded in manifests.
    pub ignore_headers: Vec<PathBuf>,
    pub cache_failed_compilations: bool,
    pub compression: Compression,
    pub umask: Option<u32>,
    /// Applied to the arguments of inputs built with [`CompilationCache::inputs_builder`].
    pub arg_filter: ArgFilter,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            direct_mode: true,
            sloppiness: Sloppiness::default(),
            max_manifest_candidates: 100,
            ignore_headers: Vec::new(),
            cache_failed_compilations: false,
            compression: Compression::default(),
            umask: None,
            arg_filter: ArgFilter::default(),
        }
    }
}

impl LookupOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            direct_mode: config.direct_mode,
            sloppiness: config.sloppiness,
            max_manifest_candidates: config.max_manifest_candidates,
            ignore_headers: config.ignore_headers_in_manifest.clone(),
            cache_failed_compilations: config.cache_failed_compilations,
            compression: config.compression(),
            umask: config.umask,
            arg_filter: ArgFilter::from_config(config),
        }
    }
}

/// What direct mode learned about the source, kept for storing the result afterwards.
struct DirectContext {
    source_digest: Digest,
    manifest_key: StorageKey,
}

/// A compilation cache backed by a storage chain.
#[derive(Debug)]
pub struct CompilationCache {
    storage: Storage,
    options: LookupOptions,
    resolver: FileResolver,
}

impl CompilationCache {
    pub fn new(storage: Storage, options: LookupOptions) -> Self {
        Self {
            storage,
            options,
            resolver: FileResolver::with_inode_cache(InodeCache::default()),
        }
    }

    pub fn from_config(config: &Config) -> CacheResult<Self> {
        let storage = Storage::from_config(config)?;
        Ok(Self::new(storage, LookupOptions::from_config(config)))
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn options(&self) -> &LookupOptions {
        &self.options
    }

    /// Starts the inputs of a compiler invocation, dropping the configured ignored options from
    /// the arguments.
    pub fn inputs_builder(
        &self,
        compiler: impl Into<String>,
        version: impl Into<String>,
    ) -> CommonHashInputsBuilder {
        CommonHashInputs::builder(compiler, version).arg_filter(self.options.arg_filter.clone())
    }

    /// Answers a compiler invocation from the cache, compiling and storing on a miss.
    ///
    /// Statistics recorded during the lookup are flushed before returning, whatever the outcome.
    #[tracing::instrument(skip_all, fields(source = %compilation.source_path().display()))]
    pub async fn lookup(
        &self,
        inputs: &CommonHashInputs,
        compilation: &dyn Compilation,
    ) -> Result<Outcome, LookupError> {
        #[cfg(unix)]
        let _umask = self.options.umask.map(crate::utils::umask::UmaskGuard::set);

        let start = Instant::now();
        let outcome = self.run(inputs, compilation).await;
        self.storage.flush_stats();

        match &outcome {
            Ok(outcome) => {
                tracing::debug!("lookup finished: {}", outcome.verdict.as_ref());
                metric!(timer("lookup.duration") = start.elapsed(), "verdict" => outcome.verdict.as_ref());
            }
            Err(error) => {
                tracing::warn!("lookup failed: {}", error);
                metric!(counter("lookup.error") += 1);
            }
        }
        outcome
    }

    async fn run(
        &self,
        inputs: &CommonHashInputs,
        compilation: &dyn Compilation,
    ) -> Result<Outcome, LookupError> {
        let compilation_started = SystemTime::now();
        let results = ResultStore::new(&self.storage, self.options.compression);
        let source_path = compilation.source_path();

        let direct = match self.direct_context(inputs, source_path) {
            Some(direct) => {
                if let Some(result) = self.direct_lookup(&results, &direct).await? {
                    self.storage.record(&direct.manifest_key, Counter::DirectHit);
                    return Ok(Outcome {
                        verdict: Verdict::DirectHit,
                        result,
                    });
                }
                Some(direct)
            }
            None => None,
        };

        let preprocessed = compilation.preprocess().await.map_err(LookupError::Compiler)?;
        let preprocessed_key = preprocessed_result_key(inputs, &Digest::of(&preprocessed.output));
        tracing::debug!("preprocessed result key: {}", preprocessed_key);

        if let Some(result) = results.get(&preprocessed_key).await? {
            self.storage.record(&preprocessed_key, Counter::PreprocessedHit);
            if let Some(direct) = &direct {
                self.remember(
                    &results,
                    inputs,
                    source_path,
                    direct,
                    &preprocessed,
                    &result,
                    compilation_started,
                )
                .await?;
            }
            return Ok(Outcome {
                verdict: Verdict::PreprocessedHit,
                result,
            });
        }

        let output = compilation.compile().await.map_err(LookupError::Compiler)?;
        if output.exit_status != 0 && !self.options.cache_failed_compilations {
            tracing::debug!("compilation failed with status {}", output.exit_status);
            self.storage.record(&preprocessed_key, Counter::CompileFailed);
            return Ok(Outcome {
                verdict: Verdict::Uncacheable,
                result: ResultEntry::from_output(output),
            });
        }
        if output.exit_status == 0 && output.object.is_none() {
            tracing::debug!("compiler produced no object file");
            self.storage.record(&preprocessed_key, Counter::Uncacheable);
            return Ok(Outcome {
                verdict: Verdict::Uncacheable,
                result: ResultEntry::from_output(output),
            });
        }

        let result = ResultEntry::from_output(output);
        self.storage.record(&preprocessed_key, Counter::Miss);
        results.put(&preprocessed_key, &result).await?;
        if let Some(direct) = &direct {
            self.remember(
                &results,
                inputs,
                source_path,
                direct,
                &preprocessed,
                &result,
                compilation_started,
            )
            .await?;
        }

        Ok(Outcome {
            verdict: Verdict::Miss,
            result,
        })
    }

    /// Hashes the source for direct mode, or returns `None` if direct mode cannot be used.
    fn direct_context(
        &self,
        inputs: &CommonHashInputs,
        source_path: &Path,
    ) -> Option<DirectContext> {
        if !self.options.direct_mode {
            return None;
        }
        let source = match fs::read(source_path) {
            Ok(source) => source,
            Err(error) => {
                tracing::debug!(
                    "direct mode disabled, cannot read {}: {}",
                    source_path.display(),
                    error
                );
                return None;
            }
        };
        if !self.options.sloppiness.time_macros && contains_temporal_macros(&source) {
            tracing::debug!("direct mode disabled, {} uses time macros", source_path.display());
            metric!(counter("lookup.direct.time_macros") += 1);
            return None;
        }

        let source_digest = Digest::of(&source);
        Some(DirectContext {
            manifest_key: manifest_key(inputs, source_path, &source_digest),
            source_digest,
        })
    }

    async fn direct_lookup(
        &self,
        results: &ResultStore<'_>,
        direct: &DirectContext,
    ) -> CacheResult<Option<ResultEntry>> {
        let Some(manifest) = Manifest::lookup(&self.storage, &direct.manifest_key).await? else {
            tracing::debug!("no manifest {}", direct.manifest_key);
            return Ok(None);
        };
        let Some(result_key) = manifest.find_valid_candidate(&self.resolver) else {
            tracing::debug!("no valid candidate in manifest {}", direct.manifest_key);
            return Ok(None);
        };
        results.get(&result_key).await
    }

    /// Stores `result` under its direct mode key and adds it to the manifest.
    ///
    /// Headers modified at or after `compilation_started` may not match what the preprocessor
    /// saw, so nothing is recorded when one of them is found.
    #[allow(clippy::too_many_arguments)]
    async fn remember(
        &self,
        results: &ResultStore<'_>,
        inputs: &CommonHashInputs,
        source_path: &Path,
        direct: &DirectContext,
        preprocessed: &Preprocessed,
        result: &ResultEntry,
        compilation_started: SystemTime,
    ) -> CacheResult<()> {
        let paths: Vec<_> = preprocessed
            .included_headers
            .iter()
            .filter(|path| {
                !self
                    .options
                    .ignore_headers
                    .iter()
                    .any(|ignored| matches_dir_prefix_or_file(ignored, path))
            })
            .cloned()
            .collect();

        if !self.options.sloppiness.include_file_mtime {
            if let Some(path) = paths
                .iter()
                .find(|path| modified_since(path, compilation_started))
            {
                tracing::debug!("not recording manifest, {} is too new", path.display());
                metric!(counter("lookup.manifest.too_new") += 1);
                return Ok(());
            }
        }

        let Some(headers) = hash_headers(&self.resolver, &paths) else {
            tracing::debug!("not recording manifest, an included header cannot be hashed");
            return Ok(());
        };

        let result_key = direct_result_key(inputs, source_path, &direct.source_digest, &headers);
        results.put(&result_key, result).await?;
        self.update_manifest(direct, headers, result_key.digest).await
    }

    async fn update_manifest(
        &self,
        direct: &DirectContext,
        headers: Vec<HeaderEntry>,
        result_key: Digest,
    ) -> CacheResult<()> {
        let updated = Manifest::update(
            &self.storage,
            &direct.manifest_key,
            headers,
            result_key,
            self.options.max_manifest_candidates,
            self.options.compression,
        )
        .await;
        match updated {
            Err(CacheError::CorruptEntry(message)) => {
                tracing::warn!("manifest {} not stored: {}", direct.manifest_key, message);
                Ok(())
            }
            other => other,
        }
    }
}

/// Returns `true` if the file at `path` was modified or changed status at or after `since`.
fn modified_since(path: &Path, since: SystemTime) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let modified = metadata.modified().is_ok_and(|mtime| mtime >= since);
    modified || changed_since(&metadata, since)
}

#[cfg(unix)]
fn changed_since(metadata: &fs::Metadata, since: SystemTime) -> bool {
    use std::os::unix::fs::MetadataExt;
    use std::time::{Duration, UNIX_EPOCH};

    let (Ok(secs), Ok(nanos)) = (
        u64::try_from(metadata.ctime()),
        u32::try_from(metadata.ctime_nsec()),
    ) else {
        return false;
    };
    UNIX_EPOCH + Duration::new(secs, nanos) >= since
}

#[cfg(not(unix))]
fn changed_since(_metadata: &fs::Metadata, _since: SystemTime) -> bool {
    false
}
