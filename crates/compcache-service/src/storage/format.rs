//! The container every blob is framed in.
//!
//! ```text
//! magic      4 bytes   "cCcH"
//! version    u8
//! kind       u8        0 = manifest, 1 = result
//! compression u8       0 = none, 1 = zstd
//! level      i8        compression level, informational
//! length     u64 BE    length of the uncompressed payload
//! body       ...       payload, compressed as declared
//! checksum   32 bytes  SHA-256 of the uncompressed payload
//! ```
//!
//! Any mismatch while decoding yields [`CacheError::CorruptEntry`].

use std::borrow::Cow;

use sha2::{Digest as _, Sha256};

use super::EntryKind;
use crate::error::{CacheError, CacheResult};

const MAGIC: [u8; 4] = *b"cCcH";

/// The current container version. Blobs with any other version are rejected.
pub const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = MAGIC.len() + 4 + 8;
const CHECKSUM_LEN: usize = 32;

/// Payloads larger than this are rejected before decompressing.
const MAX_PAYLOAD_LEN: u64 = 1 << 31;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_ZSTD: u8 = 1;

/// How a blob payload is compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    /// zstd with the given level.
    Zstd(i32),
}

impl Default for Compression {
    fn default() -> Self {
        Self::Zstd(1)
    }
}

/// Frames `payload` into a blob.
pub fn encode(kind: EntryKind, payload: &[u8], compression: Compression) -> Vec<u8> {
    let (method, level, body) = match compression {
        Compression::None => (COMPRESSION_NONE, 0, Cow::Borrowed(payload)),
        Compression::Zstd(level) => match zstd::bulk::compress(payload, level) {
            Ok(compressed) => (COMPRESSION_ZSTD, level, Cow::Owned(compressed)),
            Err(error) => {
                tracing::warn!("zstd compression failed, storing uncompressed: {}", error);
                (COMPRESSION_NONE, 0, Cow::Borrowed(payload))
            }
        },
    };

    let mut blob = Vec::with_capacity(HEADER_LEN + body.len() + CHECKSUM_LEN);
    blob.extend_from_slice(&MAGIC);
    blob.push(FORMAT_VERSION);
    blob.push(kind.tag());
    blob.push(method);
    blob.push(level.clamp(i8::MIN.into(), i8::MAX.into()) as i8 as u8);
    blob.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    blob.extend_from_slice(&body);
    blob.extend_from_slice(&Sha256::digest(payload));
    blob
}

/// Unframes a blob, verifying its header and checksum.
pub fn decode(kind: EntryKind, blob: &[u8]) -> CacheResult<Vec<u8>> {
    if blob.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(CacheError::corrupt(format!(
            "{kind} blob is truncated ({} bytes)",
            blob.len()
        )));
    }

    let (header, rest) = blob.split_at(HEADER_LEN);
    let (body, checksum) = rest.split_at(rest.len() - CHECKSUM_LEN);

    if header[..4] != MAGIC {
        return Err(CacheError::corrupt(format!("{kind} blob has a bad magic")));
    }
    if header[4] != FORMAT_VERSION {
        return Err(CacheError::corrupt(format!(
            "{kind} blob has unsupported format version {}",
            header[4]
        )));
    }
    if EntryKind::from_tag(header[5]) != Some(kind) {
        return Err(CacheError::corrupt(format!(
            "expected a {kind} blob, found kind tag {}",
            header[5]
        )));
    }

    let mut length = [0; 8];
    length.copy_from_slice(&header[8..16]);
    let length = u64::from_be_bytes(length);
    if length > MAX_PAYLOAD_LEN {
        return Err(CacheError::corrupt(format!(
            "{kind} blob declares {length} bytes, more than the allowed {MAX_PAYLOAD_LEN}"
        )));
    }

    let payload = match header[6] {
        COMPRESSION_NONE => body.to_vec(),
        // the declared length bounds the output, a payload inflating beyond it is corrupt
        COMPRESSION_ZSTD => zstd::bulk::decompress(body, length as usize)
            .map_err(|e| CacheError::corrupt(format!("{kind} blob fails to decompress: {e}")))?,
        other => {
            return Err(CacheError::corrupt(format!(
                "{kind} blob has unknown compression {other}"
            )));
        }
    };

    if payload.len() as u64 != length {
        return Err(CacheError::corrupt(format!(
            "{kind} blob declares {length} bytes but holds {}",
            payload.len()
        )));
    }
    if Sha256::digest(&payload).as_slice() != checksum {
        return Err(CacheError::corrupt(format!(
            "{kind} blob fails checksum verification"
        )));
    }

    Ok(payload)
}
