//! Host-scoped advisory locks.
//!
//! Name allocation races against other runner processes on the same host,
//! so the rename step serializes through an exclusive `flock` on a file
//! keyed by the name template. Races against a third, unseen renamer are
//! only mitigated, not eliminated.

use crate::error::{Error, Result};
use crate::paths;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const LOCK_WAIT: Duration = Duration::from_secs(2);

/// An exclusive advisory lock on a named file under the host temp dir.
/// Released on drop, so every exit path unlocks.
#[derive(Debug)]
pub struct NamedLock {
    file: File,
    path: PathBuf,
}

impl NamedLock {
    /// Acquire the lock for `name`, polling with a fixed wait until the
    /// bounded timeout elapses. Timing out is fatal.
    pub fn acquire(name: &str) -> Result<NamedLock> {
        Self::acquire_with_timeout(name, LOCK_TIMEOUT, LOCK_WAIT)
    }

    pub fn acquire_with_timeout(name: &str, timeout: Duration, wait: Duration) -> Result<NamedLock> {
        let path = paths::lock_dir().join(format!("{}.lock", sanitize(name)));
        let start = Instant::now();

        loop {
            let file = File::create(&path).map_err(|e| {
                Error::Lock(format!("{}: {}", path.display(), e))
            })?;

            if try_flock(&file) {
                log_status!("lock", "Locked {} for pid {}", path.display(), std::process::id());
                return Ok(NamedLock { file, path });
            }

            if start.elapsed() >= timeout {
                return Err(Error::Lock(path.display().to_string()));
            }
            log_status!("lock", "Waiting {:?} for lock {}", wait, path.display());
            std::thread::sleep(wait);
        }
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        log_status!("lock", "Unlocked {}", self.path.display());
    }
}

fn try_flock(file: &File) -> bool {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    rc == 0
}

/// Lock file names come from name templates, which may carry `%` and `/`.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let lock = NamedLock::acquire("rigger-test-lock-a").unwrap();
        drop(lock);
        // Re-acquire after release should succeed immediately.
        let _lock = NamedLock::acquire_with_timeout(
            "rigger-test-lock-a",
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .unwrap();
    }

    #[test]
    fn second_acquire_times_out_while_held() {
        let _held = NamedLock::acquire("rigger-test-lock-b").unwrap();
        let err = NamedLock::acquire_with_timeout(
            "rigger-test-lock-b",
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .unwrap_err();
        assert_eq!(err.code(), "LOCK_ERROR");
    }

    #[test]
    fn sanitize_replaces_template_characters() {
        assert_eq!(sanitize("target%02d"), "target_02d");
    }
}
