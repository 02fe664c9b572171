use std::fmt;
use std::path::PathBuf;

use crate::hashing::Digest;

/// The two kinds of blobs in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    Manifest,
    Result,
}

impl EntryKind {
    /// The character appended to file names of this kind.
    pub fn suffix(self) -> char {
        match self {
            EntryKind::Manifest => 'M',
            EntryKind::Result => 'R',
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            EntryKind::Manifest => 0,
            EntryKind::Result => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(EntryKind::Manifest),
            1 => Some(EntryKind::Result),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Manifest => "manifest",
            EntryKind::Result => "result",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the 256 top level directories of the local cache.
///
/// A key belongs to the shard named by the first byte of its digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shard(u8);

impl Shard {
    pub const COUNT: usize = 256;

    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    pub fn all() -> impl Iterator<Item = Shard> {
        (0..=u8::MAX).map(Shard)
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// The address of a blob: its kind plus its digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub kind: EntryKind,
    pub digest: Digest,
}

impl StorageKey {
    pub fn manifest(digest: Digest) -> Self {
        Self {
            kind: EntryKind::Manifest,
            digest,
        }
    }

    pub fn result(digest: Digest) -> Self {
        Self {
            kind: EntryKind::Result,
            digest,
        }
    }

    pub fn shard(&self) -> Shard {
        Shard(self.digest.as_bytes()[0])
    }

    /// The path of this key relative to a cache root.
    ///
    /// The first `levels` pairs of hex digits become nested directories, the remaining digits plus
    /// the kind suffix become the file name, e.g. `ab/cd/ef0123…R` for two levels.
    pub fn relative_path(&self, levels: usize) -> PathBuf {
        let hex = self.digest.to_hex();
        let levels = levels.min(hex.len() / 2 - 1);

        let mut path = PathBuf::new();
        for level in 0..levels {
            path.push(&hex[level * 2..level * 2 + 2]);
        }
        path.push(format!("{}{}", &hex[levels * 2..], self.kind.suffix()));
        path
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.digest, self.kind.suffix())
    }
}
