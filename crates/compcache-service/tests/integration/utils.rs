use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;

use compcache_service::config::Config;
use compcache_service::hashing::Digest;
use compcache_service::key::CommonHashInputs;
use compcache_service::lookup::{Compilation, CompilationCache, CompilerOutput, Preprocessed};
use compcache_service::storage::stats::{Counter, Counters};
use compcache_test as test;

pub use test::{BlobServer, TempDir};

/// Setup tests and create a compilation cache.
///
/// This function returns a tuple containing the cache to test, and a temporary cache
/// directory. The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as
/// guard until the test has finished.
///
/// The `update_config` closure can modify any default configuration if needed before the cache
/// is created.
pub fn setup_cache(update_config: impl FnOnce(&mut Config)) -> (CompilationCache, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = cache_in(cache_dir.path(), update_config);
    (cache, cache_dir)
}

/// Creates a compilation cache on an existing cache directory.
pub fn cache_in(cache_dir: &Path, update_config: impl FnOnce(&mut Config)) -> CompilationCache {
    let mut config = Config {
        cache_dir: cache_dir.to_owned(),
        max_size: 0,
        ..Default::default()
    };
    update_config(&mut config);
    CompilationCache::from_config(&config).unwrap()
}

/// The common inputs all tests compile with.
pub fn inputs() -> CommonHashInputs {
    CommonHashInputs::builder("/usr/bin/cc", "cc (GCC) 13.2.0")
        .args(&["-c", "-O2", "foo.c", "-o", "foo.o"])
        .env("LANG", Some("C"))
        .build()
}

/// Reads the summed counters of the cache.
pub fn counters(cache: &CompilationCache) -> Counters {
    cache.storage().summary().unwrap().counters
}

pub fn count(cache: &CompilationCache, counter: Counter) -> i64 {
    counters(cache).get(counter)
}

/// A source tree with `foo.c` including `foo.h`.
pub struct Project {
    pub dir: TempDir,
}

impl Project {
    pub fn new(source: &str, header: &str) -> Self {
        let project = Self {
            dir: test::tempdir(),
        };
        project.write("foo.c", source);
        project.write("include/foo.h", header);
        project
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, content: &str) {
        let path = self.path(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn compilation(&self) -> FakeCompilation {
        FakeCompilation::new(self.path("foo.c"), vec![self.path("include/foo.h")])
    }
}

/// A compiler whose preprocessor concatenates the headers and the source, and whose objects are
/// derived from the preprocessed source.
pub struct FakeCompilation {
    source: PathBuf,
    headers: Vec<PathBuf>,
    /// A file written right after the preprocessor has read the sources.
    after_preprocess: Option<(PathBuf, String)>,
    /// A file written while the compiler runs.
    during_compile: Option<(PathBuf, String)>,
    pub exit_status: i32,
    pub preprocess_calls: AtomicUsize,
    pub compile_calls: AtomicUsize,
}

impl FakeCompilation {
    pub fn new(source: PathBuf, headers: Vec<PathBuf>) -> Self {
        Self {
            source,
            headers,
            after_preprocess: None,
            during_compile: None,
            exit_status: 0,
            preprocess_calls: AtomicUsize::new(0),
            compile_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self) -> Self {
        self.exit_status = 1;
        self
    }

    /// Simulates an editor saving `path` just after the preprocessor ran.
    pub fn write_after_preprocess(mut self, path: PathBuf, content: &str) -> Self {
        self.after_preprocess = Some((path, content.to_owned()));
        self
    }

    /// Simulates an editor saving `path` while the compiler runs.
    pub fn write_during_compile(mut self, path: PathBuf, content: &str) -> Self {
        self.during_compile = Some((path, content.to_owned()));
        self
    }

    pub fn preprocess_calls(&self) -> usize {
        self.preprocess_calls.load(Ordering::Relaxed)
    }

    pub fn compile_calls(&self) -> usize {
        self.compile_calls.load(Ordering::Relaxed)
    }

    fn preprocessed(&self) -> anyhow::Result<Vec<u8>> {
        let mut output = Vec::new();
        for header in &self.headers {
            output.extend(fs::read(header)?);
        }
        output.extend(fs::read(&self.source)?);
        Ok(output)
    }

    /// The object this compiler produces for the current state of the source tree.
    pub fn expected_object(&self) -> Vec<u8> {
        let preprocessed = self.preprocessed().unwrap();
        format!("object {}", Digest::of(&preprocessed)).into_bytes()
    }
}

impl Compilation for FakeCompilation {
    fn source_path(&self) -> &Path {
        &self.source
    }

    fn preprocess(&self) -> BoxFuture<'_, anyhow::Result<Preprocessed>> {
        Box::pin(async move {
            self.preprocess_calls.fetch_add(1, Ordering::Relaxed);
            let output = self.preprocessed()?;
            if let Some((path, content)) = &self.after_preprocess {
                write_later(path, content).await;
            }
            Ok(Preprocessed {
                output,
                included_headers: self.headers.clone(),
            })
        })
    }

    fn compile(&self) -> BoxFuture<'_, anyhow::Result<CompilerOutput>> {
        Box::pin(async move {
            self.compile_calls.fetch_add(1, Ordering::Relaxed);
            if let Some((path, content)) = &self.during_compile {
                write_later(path, content).await;
            }
            if self.exit_status != 0 {
                return Ok(CompilerOutput {
                    exit_status: self.exit_status,
                    stderr: b"foo.c:1: error: expected ';'".to_vec(),
                    ..Default::default()
                });
            }
            Ok(CompilerOutput {
                exit_status: 0,
                object: Some(self.expected_object()),
                stderr: b"foo.c:1: warning: unused variable 'x'".to_vec(),
                ..Default::default()
            })
        })
    }
}

/// Writes `content` to `path` once the file system clock has surely advanced past the start of
/// the running lookup. File timestamps come from a coarse clock that may lag a few milliseconds.
async fn write_later(path: &Path, content: &str) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    fs::write(path, content).unwrap();
}
