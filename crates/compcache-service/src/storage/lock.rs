use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs4::FileExt;

use crate::error::{CacheError, CacheResult};

const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// An exclusive advisory lock on a shard.
///
/// The lock is held by the open file handle and released when the guard is dropped. Since the
/// operating system releases advisory locks of exited processes, a crashed process never leaves a
/// stale lock behind.
#[derive(Debug)]
pub struct ShardLock {
    file: File,
    path: PathBuf,
}

impl ShardLock {
    /// Acquires the lock file at `path`, retrying with backoff until `timeout` passes.
    pub fn acquire(path: &Path, timeout: Duration) -> CacheResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CacheError::io(path, e))?;

        let start = Instant::now();
        let mut backoff = Duration::from_millis(1);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_owned(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(CacheError::io(path, err)),
            }

            if start.elapsed() >= timeout {
                tracing::debug!("giving up on lock {} after {:?}", path.display(), timeout);
                return Err(CacheError::LockTimeout(path.to_owned()));
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ShardLock {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.file) {
            tracing::debug!("failed to unlock {}: {}", self.path.display(), error);
        }
    }
}
