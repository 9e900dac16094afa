//! SIGINT latch for graceful run aborts.
//!
//! The first Ctrl-C sets [`INTERRUPTED`] and restores the default handler,
//! so in-flight cases finish and the report is still written; a second
//! Ctrl-C terminates immediately.
use std::sync::atomic::{AtomicBool, Ordering};

pub static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_sigint(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    // SAFETY: signal(2) is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

/// Install the SIGINT handler. Returns false if installation failed.
#[cfg(unix)]
pub fn install_sigint_handler() -> bool {
    let handler = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only touches an atomic and calls signal(2).
    let previous = unsafe { libc::signal(libc::SIGINT, handler) };
    previous != libc::SIG_ERR
}

#[cfg(not(unix))]
pub fn install_sigint_handler() -> bool {
    false
}
