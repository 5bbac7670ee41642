//! Cross-process startup lock.
//!
//! The server holds the lock exclusively while its listeners come up and the
//! first workers are launched. A worker waits for a shared lock before it
//! connects back, so it never races the listener it is about to dial.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use log::debug;
use rustix::fs::{FlockOperation, flock};

use super::error::LockError;

/// A lock file shared between the server and its workers.
#[derive(Debug)]
pub struct NamedLock {
    path: PathBuf,
    file: File,
}

impl NamedLock {
    /// Open (creating if needed) the lock file.
    ///
    /// Workers open it before entering their jail, since the path is not
    /// reachable afterwards.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock exclusively until the guard is dropped.
    pub fn hold(&self) -> Result<LockGuard<'_>, LockError> {
        self.apply(FlockOperation::LockExclusive)?;
        debug!("Holding startup lock {}", self.path.display());
        Ok(LockGuard { lock: self })
    }

    /// Block until no one holds the lock exclusively.
    pub fn wait_released(&self) -> Result<(), LockError> {
        self.apply(FlockOperation::LockShared)?;
        self.apply(FlockOperation::Unlock)
    }

    /// Whether an exclusive holder exists right now.
    pub fn is_held_elsewhere(&self) -> Result<bool, LockError> {
        match flock(&self.file, FlockOperation::NonBlockingLockShared) {
            Ok(()) => {
                self.apply(FlockOperation::Unlock)?;
                Ok(false)
            }
            Err(e) if e == rustix::io::Errno::WOULDBLOCK => Ok(true),
            Err(e) => Err(LockError::Lock {
                path: self.path.clone(),
                source: e.into(),
            }),
        }
    }

    fn apply(&self, operation: FlockOperation) -> Result<(), LockError> {
        flock(&self.file, operation).map_err(|e| LockError::Lock {
            path: self.path.clone(),
            source: e.into(),
        })
    }
}

/// Releases the exclusive lock on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a NamedLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.apply(FlockOperation::Unlock) {
            log::warn!("Failed to release startup lock: {}", e);
        } else {
            debug!("Released startup lock {}", self.lock.path.display());
        }
    }
}
