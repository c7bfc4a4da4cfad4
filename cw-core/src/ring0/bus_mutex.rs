//! Cross-process ISA bus lock
//!
//! SMBus/SuperIO style hardware behind index/data port pairs must not be
//! driven by two processes at once. An exclusive `flock` on a well-known
//! file serializes corewatch instances on the same machine.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::constants::{paths, ring0};

pub struct BusMutex {
    file: File,
    path: PathBuf,
    held: bool,
}

/// Default lock location, falling back to the temp dir when /run/lock is absent.
pub fn default_lock_path() -> PathBuf {
    let run = Path::new(paths::LOCK_DIR);
    if run.is_dir() {
        run.join(paths::BUS_LOCK_FILE)
    } else {
        std::env::temp_dir().join(paths::BUS_LOCK_FILE)
    }
}

impl BusMutex {
    /// Open (creating if needed) the lock file. `None` means no lock is available.
    pub fn open(path: &Path) -> Option<Self> {
        match OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path) {
            Ok(file) => Some(Self {
                file,
                path: path.to_path_buf(),
                held: false,
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Bus lock file unavailable");
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Try to take the lock until `timeout` elapses.
    ///
    /// Returns false only on timeout. Any other failure proceeds as if
    /// the lock had been acquired.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if self.held {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            // SAFETY: the descriptor belongs to self.file for its whole lifetime.
            let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                self.held = true;
                return true;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                trace!(error = %err, "Bus lock failed, proceeding unserialized");
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(ring0::BUS_LOCK_POLL);
        }
    }

    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        // SAFETY: see wait().
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        self.held = false;
    }
}

impl Drop for BusMutex {
    fn drop(&mut self) {
        self.release();
    }
}
