use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// An error raised by the cache engine.
///
/// A missing entry is never an error: lookups return `Ok(None)` for that case. The variants here
/// all describe something that went wrong while the cache was consulted.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A blob exists, but its framing, checksum or payload could not be decoded.
    ///
    /// Callers treat corrupt entries like misses and remove them.
    #[error("corrupt cache entry: {0}")]
    CorruptEntry(String),

    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    /// The advisory lock of a shard could not be acquired in time.
    #[error("timed out waiting for lock {}", .0.display())]
    LockTimeout(PathBuf),

    /// The configuration is invalid, or the cache directory is unusable.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A secondary backend failed or answered unexpectedly.
    #[error("secondary storage error: {0}")]
    Remote(String),

    /// A secondary backend did not answer within its timeout.
    #[error("secondary storage timed out after {0:?}")]
    Timeout(Duration),
}

impl CacheError {
    /// Wraps an [`io::Error`] together with the path it occurred on.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_owned(),
            source,
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptEntry(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns `true` for errors caused by a secondary backend.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Timeout(_))
    }
}

pub type CacheResult<T = ()> = Result<T, CacheError>;

/// Runs `f`, mapping a [`io::ErrorKind::NotFound`] into `Ok(None)`.
pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(result) => Ok(Some(result)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = CacheError::io(
            "/cache/ab/lock",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "I/O error at /cache/ab/lock: denied");

        let err = CacheError::Timeout(Duration::from_secs(2));
        assert_eq!(err.to_string(), "secondary storage timed out after 2s");
        assert!(err.is_remote());
    }

    #[test]
    fn test_catch_not_found() {
        let missing = catch_not_found(|| std::fs::read("/definitely/not/a/file")).unwrap();
        assert!(missing.is_none());

        let err = catch_not_found(|| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        });
        assert!(err.is_err());
    }
}
