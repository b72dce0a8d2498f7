//! Host-wide run lock guaranteeing a single orchestrator instance.
//!
//! Advisory, host-local exclusion: one lock file holding the holder PID.
//! There is no fencing token and no lease expiry; correctness depends on
//! only one orchestrator binary running per host.

use crate::error::{BackupError, BackupResult};
use log::{debug, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Handle for the acquired lock. Dropping it releases the lock, so every
/// exit path (success, fatal error, panic unwind) leaves the file absent.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    released: bool,
}

impl RunLock {
    /// Take the lock, replacing a stale record whose holder is no longer
    /// alive. Fails with [`BackupError::AlreadyRunning`] while the recorded
    /// holder process exists.
    pub fn acquire(path: &Path) -> BackupResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match contents.trim().parse::<u32>() {
                Ok(pid) if process_alive(pid) => {
                    return Err(BackupError::AlreadyRunning { pid });
                }
                Ok(pid) => {
                    warn!("replacing stale run lock held by dead pid {pid}");
                }
                Err(_) => {
                    warn!("replacing unreadable run lock at {}", path.display());
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        debug!("run lock acquired at {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    /// Remove the lock record. Safe to call more than once.
    pub fn release(&mut self) -> BackupResult<()> {
        if self.released {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.released = true;
        debug!("run lock released at {}", self.path.display());
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
