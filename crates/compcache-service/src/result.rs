//! Stored compilation results.
//!
//! The payload of a result blob is a compact binary list:
//!
//! ```text
//! exit status  i32 BE
//! count        u8
//! count times:
//!   kind       u8
//!   length     u64 BE
//!   data       length bytes
//! ```

use std::fmt;

use crate::error::{CacheError, CacheResult};
use crate::lookup::CompilerOutput;
use crate::storage::{Compression, EntryKind, Storage, StorageKey, format};

/// The kind of a file stored in a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileKind {
    Object,
    Stdout,
    Stderr,
    Dependency,
    DwarfObject,
    Coverage,
}

impl FileKind {
    pub fn tag(self) -> u8 {
        match self {
            FileKind::Object => 0,
            FileKind::Stdout => 1,
            FileKind::Stderr => 2,
            FileKind::Dependency => 3,
            FileKind::DwarfObject => 4,
            FileKind::Coverage => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => FileKind::Object,
            1 => FileKind::Stdout,
            2 => FileKind::Stderr,
            3 => FileKind::Dependency,
            4 => FileKind::DwarfObject,
            5 => FileKind::Coverage,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Object => "object",
            FileKind::Stdout => "stdout",
            FileKind::Stderr => "stderr",
            FileKind::Dependency => "dependency",
            FileKind::DwarfObject => "dwarf object",
            FileKind::Coverage => "coverage",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outputs of one compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultEntry {
    pub exit_status: i32,
    pub files: Vec<(FileKind, Vec<u8>)>,
}

impl ResultEntry {
    pub fn new(exit_status: i32) -> Self {
        Self {
            exit_status,
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, kind: FileKind, data: impl Into<Vec<u8>>) -> Self {
        self.files.push((kind, data.into()));
        self
    }

    /// The first file of the given kind.
    pub fn file(&self, kind: FileKind) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, data)| data.as_slice())
    }

    /// Converts the output of a compiler run. Empty stdout and stderr are not stored.
    pub fn from_output(output: CompilerOutput) -> Self {
        let mut entry = Self::new(output.exit_status);
        if let Some(object) = output.object {
            entry.files.push((FileKind::Object, object));
        }
        if !output.stdout.is_empty() {
            entry.files.push((FileKind::Stdout, output.stdout));
        }
        if !output.stderr.is_empty() {
            entry.files.push((FileKind::Stderr, output.stderr));
        }
        if let Some(dependency_file) = output.dependency_file {
            entry.files.push((FileKind::Dependency, dependency_file));
        }
        entry
    }

    pub fn encode_payload(&self) -> CacheResult<Vec<u8>> {
        let count = u8::try_from(self.files.len()).map_err(|_| {
            CacheError::corrupt(format!("result has too many files ({})", self.files.len()))
        })?;
        let len = self.files.iter().map(|(_, data)| 9 + data.len()).sum::<usize>();

        let mut payload = Vec::with_capacity(5 + len);
        payload.extend_from_slice(&self.exit_status.to_be_bytes());
        payload.push(count);
        for (kind, data) in &self.files {
            payload.push(kind.tag());
            payload.extend_from_slice(&(data.len() as u64).to_be_bytes());
            payload.extend_from_slice(data);
        }
        Ok(payload)
    }

    pub fn decode_payload(payload: &[u8]) -> CacheResult<Self> {
        let mut reader = Reader(payload);
        let exit_status = i32::from_be_bytes(reader.array()?);
        let [count] = reader.array()?;

        let mut files = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let [tag] = reader.array()?;
            let kind = FileKind::from_tag(tag)
                .ok_or_else(|| CacheError::corrupt(format!("result has unknown file kind {tag}")))?;
            let len = u64::from_be_bytes(reader.array()?);
            files.push((kind, reader.bytes(len)?.to_vec()));
        }
        if !reader.0.is_empty() {
            return Err(CacheError::corrupt(format!(
                "result has {} trailing bytes",
                reader.0.len()
            )));
        }

        Ok(Self { exit_status, files })
    }

    pub fn encode(&self, compression: Compression) -> CacheResult<Vec<u8>> {
        Ok(format::encode(EntryKind::Result, &self.encode_payload()?, compression))
    }

    pub fn decode(blob: &[u8]) -> CacheResult<Self> {
        Self::decode_payload(&format::decode(EntryKind::Result, blob)?)
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: u64) -> CacheResult<&'a [u8]> {
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.0.len())
            .ok_or_else(|| CacheError::corrupt("result payload is truncated"))?;
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> CacheResult<[u8; N]> {
        let mut array = [0; N];
        array.copy_from_slice(self.bytes(N as u64)?);
        Ok(array)
    }
}

/// Reads and writes [`ResultEntry`]s through a storage chain.
#[derive(Debug, Clone, Copy)]
pub struct ResultStore<'a> {
    storage: &'a Storage,
    compression: Compression,
}

impl<'a> ResultStore<'a> {
    pub fn new(storage: &'a Storage, compression: Compression) -> Self {
        Self {
            storage,
            compression,
        }
    }

    /// Loads the result stored under `key`.
    ///
    /// A blob that cannot be decoded is removed and reported as absent.
    pub async fn get(&self, key: &StorageKey) -> CacheResult<Option<ResultEntry>> {
        let Some(blob) = self.storage.get(key).await? else {
            return Ok(None);
        };
        match ResultEntry::decode(&blob) {
            Ok(entry) => Ok(Some(entry)),
            Err(error) => {
                self.storage.remove_corrupt(key, &error);
                Ok(None)
            }
        }
    }

    /// Stores `entry` under `key`. Storing an identical entry again does not write anything.
    pub async fn put(&self, key: &StorageKey, entry: &ResultEntry) -> CacheResult<()> {
        let blob = entry.encode(self.compression)?;
        self.storage.put(key, &blob).await
    }

    pub async fn contains(&self, key: &StorageKey) -> CacheResult<bool> {
        self.storage.contains(key).await
    }
}
