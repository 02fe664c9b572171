//! Secondary storage backends.
//!
//! Secondary backends are shared between machines and strictly optional: every failure is
//! reported to the caller, who logs it and marks the backend unavailable for the rest of the
//! process.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::storage::{StorageKey, StoreResult};

mod config;
mod filesystem;
mod http;

pub use config::{AccessMode, SecondaryStorageConfig};
pub use filesystem::FilesystemBackend;
pub use http::HttpBackend;

/// The transport of a secondary backend.
#[derive(Debug, Clone)]
pub enum RemoteBackend {
    Filesystem(FilesystemBackend),
    Http(HttpBackend),
}

impl RemoteBackend {
    pub fn from_config(config: &SecondaryStorageConfig) -> CacheResult<Self> {
        match config.url.scheme() {
            "file" => {
                let path = config.url.to_file_path().map_err(|()| {
                    CacheError::configuration(format!("invalid file URL: {}", config.url))
                })?;
                Ok(Self::Filesystem(FilesystemBackend::new(path)))
            }
            "http" | "https" => Ok(Self::Http(HttpBackend::new(
                config.url.clone(),
                config.bearer_token.clone(),
                config.timeout,
            )?)),
            scheme => Err(CacheError::configuration(format!(
                "unsupported secondary storage scheme {scheme:?}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemoteBackend::Filesystem(_) => "filesystem",
            RemoteBackend::Http(_) => "http",
        }
    }

    pub async fn get(&self, key: &StorageKey) -> CacheResult<Option<Vec<u8>>> {
        match self {
            RemoteBackend::Filesystem(backend) => backend.get(key).await,
            RemoteBackend::Http(backend) => backend.get(key).await,
        }
    }

    pub async fn put(&self, key: &StorageKey, data: &[u8]) -> CacheResult<StoreResult> {
        match self {
            RemoteBackend::Filesystem(backend) => backend.put(key, data).await,
            RemoteBackend::Http(backend) => backend.put(key, data).await,
        }
    }

    pub async fn contains(&self, key: &StorageKey) -> CacheResult<bool> {
        match self {
            RemoteBackend::Filesystem(backend) => backend.contains(key).await,
            RemoteBackend::Http(backend) => backend.contains(key).await,
        }
    }
}

/// A configured secondary backend plus its availability.
#[derive(Debug)]
pub struct Secondary {
    backend: RemoteBackend,
    url: String,
    mode: AccessMode,
    timeout: Duration,
    available: AtomicBool,
}

impl Secondary {
    pub fn new(backend: RemoteBackend, url: String, mode: AccessMode, timeout: Duration) -> Self {
        Self {
            backend,
            url,
            mode,
            timeout,
            available: AtomicBool::new(true),
        }
    }

    pub fn from_config(config: &SecondaryStorageConfig) -> CacheResult<Self> {
        let backend = RemoteBackend::from_config(config)?;
        // credentials never end up in logs
        let mut url = config.url.clone();
        let _ = url.set_password(None);
        Ok(Self::new(backend, url.to_string(), config.mode, config.timeout))
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Skips this backend for the remainder of the process.
    pub fn mark_unavailable(&self) {
        if self.available.swap(false, Ordering::Relaxed) {
            tracing::info!("secondary storage {} is now skipped", self.url);
        }
    }

    pub fn can_read(&self) -> bool {
        self.mode.can_read() && self.is_available()
    }

    pub fn can_write(&self) -> bool {
        self.mode.can_write() && self.is_available()
    }

    async fn with_timeout<T, F>(&self, future: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        tokio::time::timeout(self.timeout, future)
            .await
            .unwrap_or(Err(CacheError::Timeout(self.timeout)))
    }

    pub async fn get(&self, key: &StorageKey) -> CacheResult<Option<Vec<u8>>> {
        self.with_timeout(self.backend.get(key)).await
    }

    pub async fn put(&self, key: &StorageKey, data: &[u8]) -> CacheResult<StoreResult> {
        self.with_timeout(self.backend.put(key, data)).await
    }

    pub async fn contains(&self, key: &StorageKey) -> CacheResult<bool> {
        self.with_timeout(self.backend.contains(key)).await
    }
}
