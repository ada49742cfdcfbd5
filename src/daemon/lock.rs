//! Scoped ownership of the daemon's rendezvous files.
//!
//! [`ProjectLock`] holds an exclusive `flock` on the lock file for as long
//! as it lives. [`FileGuard`] removes a file (the socket, the pid file) when
//! dropped, so every exit path from the server cleans up after itself.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{CheckdError, Result};

#[derive(Debug)]
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    /// Take the lock without blocking. Fails with
    /// [`CheckdError::LockHeld`] if another daemon owns it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(CheckdError::LockHeld(path.to_path_buf()));
            }
            return Err(errno.into());
        }

        // Record the owner for operators; the lock itself is the flock.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "project lock acquired");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        debug!(path = %self.path.display(), "project lock released");
    }
}

/// Removes `path` when dropped.
#[derive(Debug)]
pub struct FileGuard {
    path: PathBuf,
}

impl FileGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Write `contents` to `path` and guard it.
    pub fn write(path: impl Into<PathBuf>, contents: &str) -> Result<Self> {
        let path = path.into();
        fs::write(&path, contents)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.lock");

        let first = ProjectLock::acquire(&path).unwrap();
        match ProjectLock::acquire(&path) {
            Err(CheckdError::LockHeld(held)) => assert_eq!(held, path),
            other => panic!("expected LockHeld, got {other:?}"),
        }
        let owner = fs::read_to_string(&path).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());

        drop(first);
        let second = ProjectLock::acquire(&path).unwrap();
        assert_eq!(second.path(), path);
    }

    #[test]
    fn test_file_guard_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watcher.pid");
        let guard = FileGuard::write(&path, "1234").unwrap();
        assert_eq!(fs::read_to_string(guard.path()).unwrap(), "1234");
        drop(guard);
        assert!(!path.exists());

        // Already gone is fine.
        drop(FileGuard::new(dir.path().join("never-created")));
    }
}
