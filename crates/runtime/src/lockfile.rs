//! Single-run exclusivity
//!
//! The orchestrator's idempotence checks substitute for locking against
//! host state, but only under single-run exclusivity. A pid lock file
//! enforces that; a lock left by a dead process is reclaimed.

use std::path::{Path, PathBuf};

use crate::types::LockError;

/// Held for the duration of an orchestrator run; removed on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        match Self::try_create(path) {
            Ok(lock) => Ok(lock),
            Err(LockError::AlreadyRunning { pid, .. }) if !process_alive(pid) => {
                tracing::warn!(pid, path = %path.display(), "removing stale lock from dead process");
                let _ = std::fs::remove_file(path);
                Self::try_create(path)
            }
            Err(e) => Err(e),
        }
    }

    fn try_create(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path);
        match result {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let pid = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok())
                    .unwrap_or(0);
                Err(LockError::AlreadyRunning {
                    pid,
                    path: path.to_path_buf(),
                })
            }
            Err(e) => Err(LockError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid != 0 && Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // Without /proc we cannot tell; err on the side of not reclaiming.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaulthost.lock");

        let _held = LockFile::acquire(&path).unwrap();
        let err = LockFile::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { .. }));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaulthost.lock");

        drop(LockFile::acquire(&path).unwrap());
        assert!(!path.exists());
        let _again = LockFile::acquire(&path).unwrap();
    }

    #[test]
    fn stale_lock_from_dead_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaulthost.lock");

        // No live process keeps pid 0; u32::MAX exceeds any real pid.
        std::fs::write(&path, format!("{}", u32::MAX)).unwrap();
        let _lock = LockFile::acquire(&path).unwrap();
    }
}
