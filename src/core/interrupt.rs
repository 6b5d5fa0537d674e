//! Process-level interrupt handling.
//!
//! SIGINT/SIGTERM set a process-wide flag instead of killing the process
//! outright; long-running loops call [`check`] between steps so the unwind
//! still runs the configured cleanup path for equipment already created.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(signum: libc::c_int) {
    let _ = signum;
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT/SIGTERM handlers. Safe to call more than once.
pub fn install_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Surface a pending interrupt as an error so it flows through the normal
/// cleanup path.
pub fn check() -> Result<()> {
    if interrupted() {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub fn reset_for_tests() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}
