//! Process-wide registry of temporary files.
//!
//! Every temporary file the engine creates is registered here until it is either renamed into
//! place or deleted. When the process is interrupted, [`remove_pending`] deletes whatever is still
//! registered so no partial files are left behind.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

static PENDING: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

fn pending_files() -> MutexGuard<'static, BTreeSet<PathBuf>> {
    PENDING.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registered temporary file.
///
/// Dropping the guard removes the file. Call [`keep`](Self::keep) once the file has been renamed
/// into its final location.
#[derive(Debug)]
#[must_use]
pub struct TmpFileGuard {
    path: Option<PathBuf>,
}

impl TmpFileGuard {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Deregisters the file without deleting it.
    pub fn keep(mut self) {
        if let Some(path) = self.path.take() {
            pending_files().remove(&path);
        }
    }
}

impl Drop for TmpFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            pending_files().remove(&path);
            if let Err(error) = std::fs::remove_file(&path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!("failed to remove {}: {}", path.display(), error);
                }
            }
        }
    }
}

/// Registers `path` as a temporary file.
pub fn register(path: impl Into<PathBuf>) -> TmpFileGuard {
    let path = path.into();
    pending_files().insert(path.clone());
    TmpFileGuard { path: Some(path) }
}

/// Returns the currently registered temporary files.
pub fn pending() -> Vec<PathBuf> {
    pending_files().iter().cloned().collect()
}

/// Deletes all registered temporary files and returns how many were removed.
pub fn remove_pending() -> usize {
    let paths = std::mem::take(&mut *pending_files());
    paths
        .iter()
        .filter(|path| std::fs::remove_file(path).is_ok())
        .count()
}

/// Installs a handler for SIGINT and SIGTERM that removes pending temporary files and exits.
pub fn install_termination_handler() -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(|| {
        let removed = remove_pending();
        tracing::debug!("interrupted, removed {} temporary files", removed);
        std::process::exit(130);
    })
}
