//! Manifests map a compiler invocation on a source file to candidate results.
//!
//! Every candidate records the headers a previous compilation included, together with their
//! digests at that time. A candidate is only valid as long as all of its headers still have the
//! recorded content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::hashing::{Digest, HeaderResolver};
use crate::storage::{Compression, EntryKind, Storage, StorageKey, format};

/// A header and the digest of its content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub path: PathBuf,
    pub digest: Digest,
}

/// A set of headers and the result that was compiled with them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub headers: Vec<HeaderEntry>,
    pub result_key: Digest,
}

impl Candidate {
    pub fn result_key(&self) -> StorageKey {
        StorageKey::result(self.result_key)
    }
}

/// Candidates for one manifest key, oldest first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    candidates: Vec<Candidate>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// All candidates, oldest first.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn encode(&self, compression: Compression) -> CacheResult<Vec<u8>> {
        // fails for header paths that are not valid UTF-8
        let payload = serde_json::to_vec(self)
            .map_err(|e| CacheError::corrupt(format!("manifest cannot be serialized: {e}")))?;
        Ok(format::encode(EntryKind::Manifest, &payload, compression))
    }

    pub fn decode(blob: &[u8]) -> CacheResult<Self> {
        let payload = format::decode(EntryKind::Manifest, blob)?;
        serde_json::from_slice(&payload)
            .map_err(|e| CacheError::corrupt(format!("manifest payload is malformed: {e}")))
    }

    /// Loads the manifest stored under `key`.
    ///
    /// A blob that cannot be decoded is removed and reported as absent.
    pub async fn lookup(storage: &Storage, key: &StorageKey) -> CacheResult<Option<Self>> {
        let Some(blob) = storage.get(key).await? else {
            return Ok(None);
        };
        match Self::decode(&blob) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(error) => {
                storage.remove_corrupt(key, &error);
                Ok(None)
            }
        }
    }

    /// Returns the result key of the most recent candidate whose headers all still have their
    /// recorded digests.
    pub fn find_valid_candidate<R>(&self, resolver: &R) -> Option<StorageKey>
    where
        R: HeaderResolver + ?Sized,
    {
        let mut resolved: HashMap<&Path, Option<Digest>> = HashMap::new();
        let candidate = self.candidates.iter().rev().find(|candidate| {
            candidate.headers.iter().all(|header| {
                let current = *resolved
                    .entry(header.path.as_path())
                    .or_insert_with(|| resolver.resolve(&header.path));
                current == Some(header.digest)
            })
        })?;
        Some(candidate.result_key())
    }

    /// Adds a candidate as the most recent one.
    ///
    /// A candidate with the same result key is moved instead of duplicated. Beyond
    /// `max_candidates`, the oldest candidates are dropped.
    pub fn add_candidate(&mut self, headers: Vec<HeaderEntry>, result_key: Digest, max_candidates: usize) {
        self.candidates.retain(|c| c.result_key != result_key);
        self.candidates.push(Candidate {
            headers,
            result_key,
        });
        let excess = self.candidates.len().saturating_sub(max_candidates.max(1));
        self.candidates.drain(..excess);
    }

    /// Writes this manifest under `key`.
    pub async fn store(&self, storage: &Storage, key: &StorageKey, compression: Compression) -> CacheResult<()> {
        let blob = self.encode(compression)?;
        storage.put(key, &blob).await
    }

    /// Adds a candidate to the manifest stored under `key`, creating it if needed.
    pub async fn update(
        storage: &Storage,
        key: &StorageKey,
        headers: Vec<HeaderEntry>,
        result_key: Digest,
        max_candidates: usize,
        compression: Compression,
    ) -> CacheResult<()> {
        let mut manifest = Self::lookup(storage, key).await?.unwrap_or_default();
        if let Some(latest) = manifest.candidates.last() {
            if latest.result_key == result_key && latest.headers == headers {
                return Ok(());
            }
        }
        manifest.add_candidate(headers, result_key, max_candidates);
        manifest.store(storage, key, compression).await
    }
}

/// Resolves the digests of all `paths` in parallel.
///
/// Returns `None` if any header cannot be resolved.
pub fn hash_headers<R>(resolver: &R, paths: &[PathBuf]) -> Option<Vec<HeaderEntry>>
where
    R: HeaderResolver + Sync + ?Sized,
{
    paths
        .par_iter()
        .map(|path| {
            let digest = resolver.resolve(path)?;
            Some(HeaderEntry {
                path: path.clone(),
                digest,
            })
        })
        .collect()
}
