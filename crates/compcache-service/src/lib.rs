//! The compcache engine.
//!
//! compcache sits in front of a C/C++ compiler and skips recompilation whenever an identical
//! compilation has been performed before. Results are content addressed: every input that can
//! influence the produced object file is folded into a [`Digest`](hashing::Digest), and that
//! digest names a blob in the cache.
//!
//! A lookup is driven by [`CompilationCache::lookup`](lookup::CompilationCache::lookup) and goes
//! through up to three stages:
//!
//! - In *direct mode* the raw source file and the compiler arguments are hashed into a manifest
//!   key. The [`Manifest`](manifest::Manifest) stored under it lists the header sets seen in
//!   earlier compilations, and the first candidate whose headers are all unchanged names the
//!   result.
//! - Otherwise the source is preprocessed and the preprocessed output is hashed into a result key.
//! - If both miss, the real compiler runs and its output is stored for the next time.
//!
//! All blobs live in a [`Storage`](storage::Storage) chain: a sharded local directory as the
//! primary backend plus optional secondary backends that are shared between machines.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod error;
pub mod hashing;
pub mod key;
pub mod logging;
pub mod lookup;
pub mod manifest;
pub mod result;
pub mod storage;
pub mod utils;

pub use error::{CacheError, CacheResult};
