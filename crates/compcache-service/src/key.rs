//! Derivation of manifest and result keys.
//!
//! Every key starts from the [`CommonHashInputs`] of a compiler invocation: everything besides the
//! source itself that can influence the produced object. The inputs are hashed once when they are
//! built and never change afterwards.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::hashing::{Digest, Hasher};
use crate::manifest::HeaderEntry;
use crate::storage::StorageKey;

/// Bumped whenever the way keys are derived changes, which invalidates all existing entries.
pub const HASH_FORMAT_VERSION: u64 = 1;

/// Options that only name output files and never influence the object itself.
const VOLATILE_OPTIONS: [&str; 4] = ["-o", "-MF", "-MT", "-MQ"];

/// How the working directory of the compiler contributes to keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CwdMode {
    Ignore,
    /// The working directory ends up in the object, e.g. through debug info.
    Hash(PathBuf),
}

/// Drops arguments that must not influence keys.
#[derive(Clone, Debug, Default)]
pub struct ArgFilter {
    ignore_options: Vec<String>,
}

impl ArgFilter {
    /// Creates a filter that also drops the given options.
    ///
    /// An option ending in `*` drops every argument starting with the text before the `*`.
    pub fn new(ignore_options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ignore_options: ignore_options.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a filter dropping the configured `ignore_options`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ignore_options.iter().cloned())
    }

    fn is_ignored(&self, arg: &str) -> bool {
        self.ignore_options
            .iter()
            .any(|option| match option.strip_suffix('*') {
                Some(prefix) => arg.starts_with(prefix),
                None => arg == option,
            })
    }

    /// Returns the arguments that contribute to keys.
    pub fn filter<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let mut filtered = Vec::with_capacity(args.len());
        let mut args = args.iter().map(AsRef::as_ref);
        while let Some(arg) = args.next() {
            if VOLATILE_OPTIONS.contains(&arg) {
                // the next argument is the option's value
                args.next();
                continue;
            }
            let joined = VOLATILE_OPTIONS
                .iter()
                .any(|option| arg.len() > option.len() && arg.starts_with(option));
            if joined || self.is_ignored(arg) {
                continue;
            }
            filtered.push(arg.to_owned());
        }
        filtered
    }
}

/// The parts of a compiler invocation shared by all keys derived for it.
#[derive(Clone, Debug)]
pub struct CommonHashInputs {
    compiler: String,
    version: String,
    args: Vec<String>,
    env: Vec<(String, Option<String>)>,
    cwd: CwdMode,
    format_version: u64,
    digest: Digest,
}

impl CommonHashInputs {
    pub fn builder(compiler: impl Into<String>, version: impl Into<String>) -> CommonHashInputsBuilder {
        CommonHashInputsBuilder {
            compiler: compiler.into(),
            version: version.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: CwdMode::Ignore,
            filter: ArgFilter::default(),
            format_version: HASH_FORMAT_VERSION,
        }
    }

    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The filtered arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment variables sorted by name.
    pub fn env(&self) -> &[(String, Option<String>)] {
        &self.env
    }

    pub fn cwd(&self) -> &CwdMode {
        &self.cwd
    }

    pub fn format_version(&self) -> u64 {
        self.format_version
    }

    /// The digest of all inputs.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    fn hasher(&self, section: &str) -> Hasher {
        let mut hasher = Hasher::new();
        hasher.update_delimiter(section).update_digest(&self.digest);
        hasher
    }
}

/// A builder for [`CommonHashInputs`].
#[derive(Debug)]
pub struct CommonHashInputsBuilder {
    compiler: String,
    version: String,
    args: Vec<String>,
    env: Vec<(String, Option<String>)>,
    cwd: CwdMode,
    filter: ArgFilter,
    format_version: u64,
}

impl CommonHashInputsBuilder {
    /// Sets the filter applied to arguments passed to [`args`](Self::args) afterwards.
    pub fn arg_filter(mut self, filter: ArgFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        self.args.extend(self.filter.filter(args));
        self
    }

    /// Adds an environment variable, `None` meaning that it is unset.
    pub fn env(mut self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        self.env.push((name.into(), value.map(Into::into)));
        self
    }

    pub fn cwd(mut self, cwd: CwdMode) -> Self {
        self.cwd = cwd;
        self
    }

    #[cfg(test)]
    fn format_version(mut self, version: u64) -> Self {
        self.format_version = version;
        self
    }

    pub fn build(mut self) -> CommonHashInputs {
        self.env.sort();

        let mut hasher = Hasher::new();
        hasher
            .update_delimiter("format")
            .update_u64(self.format_version)
            .update_delimiter("compiler")
            .update_str(&self.compiler)
            .update_delimiter("version")
            .update_str(&self.version)
            .update_delimiter("args")
            .update_u64(self.args.len() as u64);
        for arg in &self.args {
            hasher.update_str(arg);
        }
        hasher.update_delimiter("env").update_u64(self.env.len() as u64);
        for (name, value) in &self.env {
            hasher.update_str(name).update_opt_str(value.as_deref());
        }
        hasher.update_delimiter("cwd");
        match &self.cwd {
            CwdMode::Ignore => hasher.update_bool(false),
            CwdMode::Hash(path) => hasher
                .update_bool(true)
                .update_bytes(path.as_os_str().as_encoded_bytes()),
        };

        CommonHashInputs {
            compiler: self.compiler,
            version: self.version,
            args: self.args,
            env: self.env,
            cwd: self.cwd,
            format_version: self.format_version,
            digest: hasher.finalize(),
        }
    }
}

fn update_source(hasher: &mut Hasher, source_path: &Path, source_digest: &Digest) {
    hasher
        .update_delimiter("source")
        .update_bytes(source_path.as_os_str().as_encoded_bytes())
        .update_digest(source_digest);
}

/// The key of the manifest for compiling the source at `source_path` with `source_digest`.
pub fn manifest_key(common: &CommonHashInputs, source_path: &Path, source_digest: &Digest) -> StorageKey {
    let mut hasher = common.hasher("manifest");
    update_source(&mut hasher, source_path, source_digest);
    StorageKey::manifest(hasher.finalize())
}

/// The result key of a direct mode compilation that included `headers`.
///
/// The order of `headers` does not matter.
pub fn direct_result_key(
    common: &CommonHashInputs,
    source_path: &Path,
    source_digest: &Digest,
    headers: &[HeaderEntry],
) -> StorageKey {
    let mut sorted: Vec<_> = headers.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    sorted.dedup_by(|a, b| a.path == b.path);

    let mut hasher = common.hasher("direct");
    update_source(&mut hasher, source_path, source_digest);
    hasher.update_delimiter("headers").update_u64(sorted.len() as u64);
    for header in sorted {
        hasher
            .update_bytes(header.path.as_os_str().as_encoded_bytes())
            .update_digest(&header.digest);
    }
    StorageKey::result(hasher.finalize())
}

/// The result key of a preprocessor mode compilation.
pub fn preprocessed_result_key(common: &CommonHashInputs, preprocessed_digest: &Digest) -> StorageKey {
    let mut hasher = common.hasher("preprocessed");
    hasher.update_digest(preprocessed_digest);
    StorageKey::result(hasher.finalize())
}
