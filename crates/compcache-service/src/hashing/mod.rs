//! Content digests and the incremental hasher all cache keys are built with.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::error::{CacheError, CacheResult};

mod resolver;

pub use resolver::{FileResolver, HeaderResolver, InodeCache};

/// A SHA-256 digest identifying cache content.
///
/// Digests are displayed, parsed and serialized as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; Digest::LEN]);

impl Digest {
    /// The length of a digest in bytes.
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Computes the digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Error returned when parsing a [`Digest`] from a string that is not 64 hex characters.
#[derive(Debug, Clone, Error)]
#[error("invalid digest: {0:?}")]
pub struct ParseDigestError(String);

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; Self::LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseDigestError(s.to_owned()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// Every structured field is prefixed with a type tag, and variable length fields additionally with
// their length. This keeps e.g. `["ab", "c"]` and `["a", "bc"]` from colliding.
const TAG_BYTES: u8 = b'b';
const TAG_STR: u8 = b's';
const TAG_U64: u8 = b'u';
const TAG_I64: u8 = b'i';
const TAG_BOOL: u8 = b'B';
const TAG_NONE: u8 = b'n';
const TAG_SOME: u8 = b'o';
const TAG_DELIMITER: u8 = b'd';

/// An incremental hasher producing a [`Digest`].
///
/// The hasher is append-only. Feeding the same sequence of calls always yields the same digest,
/// and any difference in the fed values yields a different one.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes without any framing.
    ///
    /// Prefer the typed `update_*` functions when hashing several fields in a row.
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    fn update_len(&mut self, tag: u8, len: usize) {
        self.inner.update([tag]);
        self.inner.update((len as u64).to_le_bytes());
    }

    pub fn update_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.update_len(TAG_BYTES, data.len());
        self.inner.update(data);
        self
    }

    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.update_len(TAG_STR, s.len());
        self.inner.update(s.as_bytes());
        self
    }

    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.inner.update([TAG_U64]);
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn update_i64(&mut self, value: i64) -> &mut Self {
        self.inner.update([TAG_I64]);
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn update_bool(&mut self, value: bool) -> &mut Self {
        self.inner.update([TAG_BOOL, value as u8]);
        self
    }

    /// Feeds an optional string, distinguishing `None` from `Some("")`.
    pub fn update_opt_str(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            None => {
                self.inner.update([TAG_NONE]);
            }
            Some(s) => {
                self.inner.update([TAG_SOME]);
                self.update_str(s);
            }
        }
        self
    }

    /// Marks the start of a named section.
    ///
    /// Sections make sure that values fed for different purposes can never be confused with each
    /// other, even when one of the sections is empty.
    pub fn update_delimiter(&mut self, name: &str) -> &mut Self {
        self.update_len(TAG_DELIMITER, name.len());
        self.inner.update(name.as_bytes());
        self
    }

    pub fn update_digest(&mut self, digest: &Digest) -> &mut Self {
        self.update_bytes(digest.as_bytes())
    }

    /// Feeds the content of the file at `path`.
    pub fn update_path(&mut self, path: &Path) -> CacheResult<&mut Self> {
        let digest = hash_file(path)?;
        Ok(self.update_digest(&digest))
    }

    pub fn finalize(self) -> Digest {
        Digest(self.inner.finalize().into())
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher").finish_non_exhaustive()
    }
}

/// Computes the digest of the file at `path`, streaming its content.
pub fn hash_file(path: &Path) -> CacheResult<Digest> {
    let mut file = File::open(path).map_err(|e| CacheError::io(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| CacheError::io(path, e))?;
    Ok(Digest(hasher.finalize().into()))
}

const TEMPORAL_MACROS: [&[u8]; 3] = [b"__DATE__", b"__TIME__", b"__TIMESTAMP__"];

/// Returns `true` if `source` mentions one of the macros that expand to the current time.
///
/// Objects compiled from such sources differ between compilations even if no input changed.
pub fn contains_temporal_macros(source: &[u8]) -> bool {
    source
        .windows(2)
        .enumerate()
        .filter(|(_, window)| *window == b"__")
        .any(|(start, _)| {
            let rest = &source[start..];
            TEMPORAL_MACROS.iter().any(|m| rest.starts_with(m))
        })
}
