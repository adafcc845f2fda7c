//! SIGINT/SIGTERM handling.
//!
//! The handlers only set a process-wide flag. The acquisition loop polls it
//! at every suspension point and returns, after which the device and the
//! broker connection are closed by their owners.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install the handlers and return the flag they set.
pub fn install() -> io::Result<&'static AtomicBool> {
    for signum in [libc::SIGINT, libc::SIGTERM] {
        let handler = request_shutdown as *const () as libc::sighandler_t;
        // SAFETY: the handler only stores to an atomic, which is
        // async-signal-safe.
        let previous = unsafe { libc::signal(signum, handler) };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(&SHUTDOWN)
}

/// Whether a shutdown signal has been received.
pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
