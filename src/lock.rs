//! Per-product advisory locks
//!
//! A lock is a `<productId>.lock` file in the depot's lock directory holding
//! the owner's PID, a random token and the acquisition time. Locks whose
//! owner process is gone are stale and get replaced.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::{FleetpkgError, Result};

/// Stale-lock replacements tried before giving up
const ACQUIRE_ATTEMPTS: usize = 5;

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub token: String,
    pub acquired: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            token: Uuid::new_v4().to_string(),
            acquired: Utc::now(),
        }
    }
}

/// Lock file operations for one lock directory
pub struct PackageLock;

impl PackageLock {
    /// Path of a product's lock file
    pub fn path(lock_dir: &Path, product_id: &str) -> PathBuf {
        lock_dir.join(format!("{}.lock", product_id))
    }

    /// Take the lock, replacing it if stale
    ///
    /// Not reentrant: a lock held by this very process is reported as locked.
    pub fn acquire(lock_dir: &Path, product_id: &str) -> Result<LockGuard> {
        fs::create_dir_all(lock_dir)?;
        let path = Self::path(lock_dir, product_id);

        for _ in 0..ACQUIRE_ATTEMPTS {
            if let Some(guard) = Self::create(lock_dir, product_id)? {
                return Ok(guard);
            }

            match Self::read(&path) {
                Some(existing) if process_alive(existing.pid) => {
                    return Err(FleetpkgError::Locked {
                        product_id: product_id.to_string(),
                        pid: existing.pid,
                    });
                }
                Some(existing) => {
                    tracing::warn!(
                        "Replacing stale lock on {} held by pid {} since {}",
                        product_id,
                        existing.pid,
                        existing.acquired
                    );
                    Self::remove_stale(lock_dir, &path, Some(&existing.token))?;
                }
                None if path.exists() => {
                    tracing::warn!("Replacing unreadable lock file {}", path.display());
                    Self::remove_stale(lock_dir, &path, None)?;
                }
                None => {}
            }
        }

        Err(FleetpkgError::Temporary(format!(
            "lock on {} changed hands {} times while acquiring",
            product_id, ACQUIRE_ATTEMPTS
        )))
    }

    /// Take the lock regardless of its current holder
    pub fn steal(lock_dir: &Path, product_id: &str) -> Result<LockGuard> {
        fs::create_dir_all(lock_dir)?;
        let path = Self::path(lock_dir, product_id);
        if let Some(existing) = Self::read(&path) {
            tracing::warn!(
                "Forcibly taking lock on {} from pid {}",
                product_id,
                existing.pid
            );
        }

        let (file, info) = Self::staged(lock_dir)?;
        file.persist(&path).map_err(|e| FleetpkgError::Io(e.error))?;
        Ok(LockGuard::new(path, product_id, info))
    }

    /// Remove the lock file whoever holds it
    pub fn release(lock_dir: &Path, product_id: &str) -> Result<()> {
        match fs::remove_file(Self::path(lock_dir, product_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current holder, if the lock file is readable
    pub fn holder(lock_dir: &Path, product_id: &str) -> Option<LockInfo> {
        Self::read(&Self::path(lock_dir, product_id))
    }

    fn read(path: &Path) -> Option<LockInfo> {
        let content = fs::read_to_string(path).ok()?;
        toml::from_str(&content).ok()
    }

    /// Lock file content written to a temp file next to the lock
    fn staged(lock_dir: &Path) -> Result<(NamedTempFile, LockInfo)> {
        let info = LockInfo::current();
        let content = toml::to_string(&info)
            .map_err(|e| FleetpkgError::Temporary(format!("Failed to encode lock: {}", e)))?;

        let mut file = NamedTempFile::new_in(lock_dir)?;
        file.write_all(content.as_bytes())?;
        file.flush()?;
        Ok((file, info))
    }

    /// Create the lock file unless one exists; `None` when it does
    fn create(lock_dir: &Path, product_id: &str) -> Result<Option<LockGuard>> {
        let path = Self::path(lock_dir, product_id);
        let (file, info) = Self::staged(lock_dir)?;

        match file.persist_noclobber(&path) {
            Ok(_) => Ok(Some(LockGuard::new(path, product_id, info))),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.error.into()),
        }
    }

    /// Move a stale lock file aside and delete it
    ///
    /// If the file moved aside is not the stale one we inspected, another
    /// process took the lock in between and the file is linked back.
    fn remove_stale(lock_dir: &Path, path: &Path, stale_token: Option<&str>) -> Result<()> {
        let aside = lock_dir.join(format!(".stale-{}", Uuid::new_v4()));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let moved = Self::read(&aside);
        let was_stale = match stale_token {
            Some(token) => moved.as_ref().is_some_and(|info| info.token == token),
            None => moved.is_none(),
        };
        if !was_stale {
            if let Err(e) = fs::hard_link(&aside, path) {
                tracing::warn!("Could not restore lock file {}: {}", path.display(), e);
            }
        }

        match fs::remove_file(&aside) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Held lock; released on drop while the file still carries our token
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    product_id: String,
    token: String,
    released: bool,
}

impl LockGuard {
    fn new(path: PathBuf, product_id: &str, info: LockInfo) -> Self {
        tracing::debug!("Locked {} with token {}", product_id, info.token);
        Self {
            path,
            product_id: product_id.to_string(),
            token: info.token,
            released: false,
        }
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the lock file still carries this guard's token
    pub fn is_held(&self) -> bool {
        PackageLock::read(&self.path)
            .map(|info| info.token == self.token)
            .unwrap_or(false)
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove_if_held()
    }

    fn remove_if_held(&self) -> Result<()> {
        if !self.is_held() {
            tracing::warn!("Lock on {} was taken over, leaving it", self.product_id);
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!("Unlocked {}", self.product_id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.remove_if_held() {
                tracing::warn!("Failed to release lock on {}: {}", self.product_id, e);
            }
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn write_holder(dir: &Path, product_id: &str, pid: u32) {
        let info = LockInfo {
            pid,
            token: "other".to_string(),
            acquired: Utc::now(),
        };
        fs::write(
            PackageLock::path(dir, product_id),
            toml::to_string(&info).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let guard = PackageLock::acquire(dir.path(), "firefox").unwrap();
        assert!(guard.is_held());

        let holder = PackageLock::holder(dir.path(), "firefox").unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.token, guard.token());

        guard.release().unwrap();
        assert!(!PackageLock::path(dir.path(), "firefox").exists());
    }

    #[test]
    fn test_not_reentrant() {
        let dir = TempDir::new().unwrap();
        let _guard = PackageLock::acquire(dir.path(), "firefox").unwrap();

        let err = PackageLock::acquire(dir.path(), "firefox").unwrap_err();
        assert!(matches!(err, FleetpkgError::Locked { pid, .. } if pid == std::process::id()));
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        write_holder(dir.path(), "firefox", 999_999_999);

        let guard = PackageLock::acquire(dir.path(), "firefox").unwrap();
        assert!(guard.is_held());
    }

    #[test]
    fn test_corrupt_lock_is_stale() {
        let dir = TempDir::new().unwrap();
        fs::write(PackageLock::path(dir.path(), "firefox"), "garbage").unwrap();

        assert!(PackageLock::acquire(dir.path(), "firefox").is_ok());
    }

    #[test]
    fn test_guard_leaves_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let guard = PackageLock::acquire(dir.path(), "firefox").unwrap();

        // Another holder took over the file
        write_holder(dir.path(), "firefox", std::process::id());
        drop(guard);

        assert!(PackageLock::path(dir.path(), "firefox").exists());
        PackageLock::release(dir.path(), "firefox").unwrap();
        assert!(!PackageLock::path(dir.path(), "firefox").exists());
    }

    fn race(dir: &Path, contenders: usize) -> usize {
        let barrier = Arc::new(Barrier::new(contenders));
        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let dir = dir.to_path_buf();
                thread::spawn(move || {
                    barrier.wait();
                    PackageLock::acquire(&dir, "firefox")
                })
            })
            .collect();

        // Guards stay alive until every contender has finished
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.iter().filter(|r| r.is_ok()).count()
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        for _ in 0..50 {
            let dir = TempDir::new().unwrap();
            assert_eq!(race(dir.path(), 4), 1);
        }
    }

    #[test]
    fn test_concurrent_stale_replacement_has_one_winner() {
        for _ in 0..50 {
            let dir = TempDir::new().unwrap();
            write_holder(dir.path(), "firefox", 999_999_999);
            assert_eq!(race(dir.path(), 2), 1);
        }
    }

    #[test]
    fn test_steal_live_lock() {
        let dir = TempDir::new().unwrap();
        write_holder(dir.path(), "firefox", std::process::id());

        let guard = PackageLock::steal(dir.path(), "firefox").unwrap();
        assert!(guard.is_held());
    }
}
