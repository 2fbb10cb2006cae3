use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;

/// Process-wide interrupt flag, armed by SIGINT/SIGTERM. The engines and
/// the outer loop poll it at their suspension points and unwind with
/// `INTERRUPTED`.

lazy_static! {
    static ref INTERRUPTED: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

extern "C" fn arm(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

pub fn install() {
    // Force the flag into existence before the handler can run.
    let _ = flag();
    let handler = arm as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

pub fn flag() -> Arc<AtomicBool> {
    INTERRUPTED.clone()
}
