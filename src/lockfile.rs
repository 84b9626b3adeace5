//! Named inter-process locks.
//!
//! Every cross-process coordination point is a lock *file* next to the data
//! file, held through OS advisory locks: `<data>.lock` for open/init,
//! `<data>.resize.lock`, `<data>.snapshot.lock`, and
//! `<data>.trie.<slot>.lock` for per-map commits.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::error::{DbError, Result};

pub struct NamedLock {
    file: File,
    path: PathBuf,
}

impl NamedLock {
    pub fn open(path: PathBuf) -> Result<NamedLock> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(DbError::Open)?;
        Ok(NamedLock { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held.
    pub fn lock(&self) -> Result<()> {
        FileExt::lock_exclusive(&self.file).map_err(DbError::Lock)
    }

    /// Take the lock shared; used to mark a live attachment so `cleanup`
    /// (which needs it exclusive) refuses to run concurrently.
    pub fn lock_shared(&self) -> Result<()> {
        FileExt::lock_shared(&self.file).map_err(DbError::Lock)
    }

    /// Attempt the lock without blocking; `false` means it is busy.
    pub fn try_lock(&self) -> Result<bool> {
        match FileExt::try_lock_exclusive(&self.file) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::EACCES) => Ok(false),
            Err(e) => Err(DbError::Lock(e)),
        }
    }

    pub fn unlock(&self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn init_lock_path(data: &Path) -> PathBuf {
    suffixed(data, ".lock")
}

pub fn resize_lock_path(data: &Path) -> PathBuf {
    suffixed(data, ".resize.lock")
}

pub fn snapshot_lock_path(data: &Path) -> PathBuf {
    suffixed(data, ".snapshot.lock")
}

pub fn commit_lock_path(data: &Path, slot: usize) -> PathBuf {
    suffixed(data, &format!(".trie.{slot}.lock"))
}

pub fn journal_path(data: &Path) -> PathBuf {
    suffixed(data, ".log")
}

fn suffixed(data: &Path, suffix: &str) -> PathBuf {
    let mut os = data.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Remove the lock-file artefacts of a data file. Only safe when no other
/// process is attached.
pub fn remove_artefacts(data: &Path, slots: usize) {
    let _ = std::fs::remove_file(init_lock_path(data));
    let _ = std::fs::remove_file(resize_lock_path(data));
    let _ = std::fs::remove_file(snapshot_lock_path(data));
    for slot in 0..slots {
        let _ = std::fs::remove_file(commit_lock_path(data, slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_reports_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let a = NamedLock::open(path.clone()).unwrap();
        let b = NamedLock::open(path).unwrap();
        assert!(a.try_lock().unwrap());
        // Advisory locks are per-fd; the second handle must see it busy.
        assert!(!b.try_lock().unwrap());
        a.unlock();
        assert!(b.try_lock().unwrap());
        b.unlock();
    }
}
