#![cfg(unix)]
//! SIGINT/SIGTERM handling for the soak run.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use libc::{c_int, sigaction, sigemptyset, sighandler_t, SA_RESTART, SIGINT, SIGTERM};

static INIT: Once = Once::new();
static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sig(_sig: c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers (idempotent).
pub fn init_term_signals() {
    INIT.call_once(|| unsafe {
        let mut action: sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sig as extern "C" fn(c_int) as sighandler_t;
        action.sa_flags = SA_RESTART;
        sigemptyset(&mut action.sa_mask);
        if sigaction(SIGINT, &action, std::ptr::null_mut()) != 0
            || sigaction(SIGTERM, &action, std::ptr::null_mut()) != 0
        {
            log::warn!("installing termination handlers failed: {}", std::io::Error::last_os_error());
        }
    });
}

/// Returns true if a termination signal was received.
pub fn should_terminate() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}
