//! Process lock file.
//!
//! sled takes an exclusive file lock on its database, and two pipelines
//! writing the same store would also race on consumer offsets. The lock file
//! in the data directory turns that into a clear startup error.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another brokerpoll process (PID {pid}) holds {}; stop it or remove the file if it is stale", .path.display())]
    Held { pid: u32, path: PathBuf },

    #[error("lock file I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, io::Error),
}

/// Lock on a data directory, released on drop.
#[derive(Debug)]
pub struct ProcessLock {
    lock_path: PathBuf,
    owned: bool,
}

impl ProcessLock {
    pub const LOCK_FILE_NAME: &'static str = ".brokerpoll.lock";

    /// Acquire the lock for `data_dir`, creating the directory if needed.
    ///
    /// A lock left behind by a process that no longer exists is replaced.
    pub fn acquire(data_dir: impl AsRef<Path>) -> Result<Self, LockError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).map_err(|e| LockError::Io(data_dir.to_path_buf(), e))?;

        let lock_path = data_dir.join(Self::LOCK_FILE_NAME);

        if let Some(pid) = read_pid(&lock_path) {
            if is_process_running(pid) {
                return Err(LockError::Held {
                    pid,
                    path: lock_path,
                });
            }
            tracing::info!(pid, "Removing stale lock file");
            fs::remove_file(&lock_path).map_err(|e| LockError::Io(lock_path.clone(), e))?;
        } else if lock_path.exists() {
            tracing::warn!(path = %lock_path.display(), "Unreadable lock file, replacing it");
            fs::remove_file(&lock_path).map_err(|e| LockError::Io(lock_path.clone(), e))?;
        }

        // create_new: a concurrent starter that got here first wins.
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    LockError::Held {
                        pid: read_pid(&lock_path).unwrap_or(0),
                        path: lock_path.clone(),
                    }
                } else {
                    LockError::Io(lock_path.clone(), e)
                }
            })?;

        let pid = std::process::id();
        writeln!(file, "{pid}").map_err(|e| LockError::Io(lock_path.clone(), e))?;

        tracing::debug!(pid, path = %lock_path.display(), "Acquired process lock");

        Ok(Self {
            lock_path,
            owned: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Release the lock (also done on drop).
    pub fn release(&mut self) {
        if self.owned {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                tracing::warn!("Failed to remove lock file: {}", e);
            }
            self.owned = false;
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks existence. EPERM means it exists under another user.
    // SAFETY: kill with signal 0 sends nothing and touches no memory.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}
