//! Host-local single-instance lock
//!
//! One scheduler loop per host: a non-blocking exclusive flock on a lock
//! file, held for the daemon's whole lifetime and released on every exit
//! path (the OS drops it with the file descriptor, signals included).

use crate::error::{IstotaError, Result};
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::File;
use std::path::PathBuf;
use tracing::debug;

pub struct InstanceLock {
    lock: RwLock<File>,
    path: PathBuf,
}

impl InstanceLock {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::options().create(true).truncate(false).write(true).open(&path)?;
        Ok(Self { lock: RwLock::new(file), path })
    }

    /// Try to take the lock without waiting. The returned guard must stay
    /// alive for as long as the daemon runs.
    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        let path = self.path.clone();
        match self.lock.try_write() {
            Ok(guard) => {
                debug!(path = %path.display(), "instance lock acquired");
                Ok(guard)
            }
            Err(_) => Err(IstotaError::AlreadyRunning { path }),
        }
    }
}
