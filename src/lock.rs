//! The run lock: an atomically-created, zero-byte file preventing concurrent
//! invocations from sharing `var/` state (§5, §6).

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Error;

use crate::error::EngineError;

pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Exclusively creates `var/apt-mirror.lock`. Fails with
    /// `EngineError::LockHeld` if it already exists, matching the "second
    /// exits non-zero before initiating any network I/O" scenario in §8.
    pub fn acquire(var_path: &Path) -> Result<Self, Error> {
        fs::create_dir_all(var_path).map_err(|e| EngineError::Io(e.to_string()))?;
        let path = var_path.join("apt-mirror.lock");

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(LockGuard { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(EngineError::LockHeld(path).into())
            }
            Err(e) => Err(EngineError::Io(e.to_string()).into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let _first = LockGuard::acquire(dir.path()).unwrap();
        let second = LockGuard::acquire(dir.path());
        assert!(second.is_err());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _guard = LockGuard::acquire(dir.path()).unwrap();
        }
        let reacquired = LockGuard::acquire(dir.path());
        assert!(reacquired.is_ok());
    }
}
