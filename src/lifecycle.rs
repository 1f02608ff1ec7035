//! Load and unload hooks.
//!
//! The dynamic loader runs the constructor before the target's `main` and
//! the destructor once execution is over. A forked child that `exec`s gets
//! a fresh constructor run of its own; a child that keeps running instead
//! inherits the parent's state minus its threads, which is what the
//! `pthread_atfork` triple repairs.

use tracing::debug;

use crate::ffi;
use crate::history;
use crate::queue;
use crate::sink;

extern "C" fn init() {
    // Descendants of a fork measure time from the root ancestor's first
    // event, not their own.
    if let Some(origin) = ffi::env_ns(ffi::ORIGIN_TIME_ENV) {
        queue::preset_origin(origin);
    }
    init_tracing();
    history::init();
    queue::restart_loop();
    unsafe {
        libc::pthread_atfork(Some(atfork_prepare), Some(atfork_parent), Some(atfork_child));
    }
    debug!(pid = ffi::getpid(), "recorder loaded");
}

extern "C" fn fini() {
    debug!(pid = ffi::getpid(), "recorder unloading");
    queue::end_loop();
    history::destroy();
    sink::close();
}

// The child must never inherit a mid-drain worker: stop it around the fork
// and bring a fresh one up on both sides.
unsafe extern "C" fn atfork_prepare() {
    queue::end_loop();
}

unsafe extern "C" fn atfork_parent() {
    queue::restart_loop();
}

unsafe extern "C" fn atfork_child() {
    queue::restart_loop();
}

fn init_tracing() {
    let Ok(filter) = std::env::var("MEM_TRACE_DEBUG") else {
        return;
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .try_init();
}

#[link_section = ".init_array"]
#[used]
static INIT: extern "C" fn() = init;

#[link_section = ".fini_array"]
#[used]
static FINI: extern "C" fn() = fini;
