//! Single-instance guard
//!
//! The lockfile is created exclusively at startup and holds the RFC 3339
//! time it was written. It is removed on graceful shutdown, on drop, and
//! from the panic hook. A lockfile left behind by a killed supervisor must
//! be removed by hand.

use anyhow::Context;
use chrono::Utc;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    released: AtomicBool,
}

impl LockFile {
    /// Create the lockfile, failing if another supervisor already holds it.
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let since = std::fs::read_to_string(path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                let since = if since.is_empty() { "unknown".to_string() } else { since };
                anyhow::bail!(
                    "Another supervisor is already running (lockfile {} created at {}). \
                     Remove the file if that process is gone.",
                    path.display(),
                    since
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create lockfile {}", path.display()))
            }
        };

        writeln!(file, "{}", Utc::now().to_rfc3339())
            .with_context(|| format!("Failed to write lockfile {}", path.display()))?;

        info!(path = %path.display(), "Lockfile acquired");
        Ok(Self {
            path: path.to_path_buf(),
            released: AtomicBool::new(false),
        })
    }

    /// Remove the lockfile. Only the first call does anything.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Lockfile released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove lockfile"),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// On any panic: report it, release the lock and exit with status 1.
pub fn install_panic_hook(lock: Arc<LockFile>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        error!(panic = %info, "Supervisor panicked, releasing lockfile");
        lock.release();
        std::process::exit(1);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burrow.lock");

        let lock = LockFile::acquire(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(content.trim()).is_ok());
        assert!(!lock.is_released());
    }

    #[test]
    fn test_second_acquire_fails_with_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burrow.lock");

        let _lock = LockFile::acquire(&path).unwrap();
        let err = LockFile::acquire(&path).unwrap_err().to_string();
        assert!(err.contains("already running"));
        assert!(err.contains("burrow.lock"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burrow.lock");

        let lock = LockFile::acquire(&path).unwrap();
        lock.release();
        assert!(!path.exists());
        assert!(lock.is_released());

        // Someone else's lock must survive our repeated release
        std::fs::write(&path, "other").unwrap();
        lock.release();
        drop(lock);
        assert!(path.exists());
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burrow.lock");

        {
            let _lock = LockFile::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        assert!(LockFile::acquire(&path).is_ok());
    }
}
