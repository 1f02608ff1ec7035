//! Raw call layer: the few libc entry points the recorder itself needs.
//!
//! Everything here may run inside an intercepted allocator call on an
//! arbitrary target thread, so the helpers stay free of locks and panics.

use std::ffi::CStr;
use std::fmt::Write as _;

use arrayvec::ArrayString;
use thiserror::Error;


/// Origin handshake between a traced process and its forked descendants.
pub const ORIGIN_TIME_ENV: &CStr = c"LD_ORIGIN_TIME";

/// Conditions the recorder cannot survive. Losing instrumentation
/// invalidates the whole trace, so none of these are recoverable.
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("dlsym failed for '{0}'")]
    Resolve(&'static str),
    #[error("failed to create log file {path:?}: {source}")]
    LogCreate {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("unknown event kind {0}")]
    UnknownKind(i32),
    #[error("failed to spawn drain worker: {0}")]
    Worker(std::io::Error),
}

/// Writes the diagnostic to stderr and terminates the process.
///
/// Bypasses the std stderr handle: that one takes a lock, and this can fire
/// from inside the allocator.
pub fn fatal(why: Fatal) -> ! {
    let mut msg = ArrayString::<512>::new();
    let _ = writeln!(msg, "mem-event-trace: {why}");
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::exit(1);
    }
}

/// Absolute wall-clock nanoseconds. The single time source of the recorder;
/// the fork origin handshake only works if every timestamp comes from here.
pub fn clock_realtime_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Kernel thread id of the calling thread, not a pthread handle.
pub fn gettid() -> libc::pid_t {
    unsafe { libc::gettid() }
}

pub fn getpid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

/// Looks `name` up with `RTLD_NEXT`: the implementation the dynamic linker
/// would have bound had this library not been loaded first. `name` must be
/// NUL-terminated.
pub fn resolve(name: &'static str) -> *mut libc::c_void {
    debug_assert!(name.ends_with('\0'));
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast()) };
    if sym.is_null() {
        fatal(Fatal::Resolve(name.trim_end_matches('\0')));
    }
    sym
}

/// Reads a decimal nanosecond value from the environment.
/// Unset, empty and malformed values all read as absent.
pub fn env_ns(name: &CStr) -> Option<u64> {
    let val = unsafe { libc::getenv(name.as_ptr()) };
    if val.is_null() {
        return None;
    }
    let val = unsafe { CStr::from_ptr(val) }.to_str().ok()?;
    val.parse().ok()
}

/// Publishes a nanosecond value into the environment so forked children
/// see it.
pub fn export_ns(name: &CStr, value: u64) {
    let mut buf = ArrayString::<24>::new();
    let _ = write!(buf, "{value}\0");
    unsafe { libc::setenv(name.as_ptr(), buf.as_ptr().cast(), 1) };
}

/// Base address of the calling thread's stack, or null when the C library
/// refuses to report it.
pub fn stack_base() -> *mut libc::c_void {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return std::ptr::null_mut();
        }
        let mut base = std::ptr::null_mut();
        let mut len = 0usize;
        let rc = libc::pthread_attr_getstack(&attr, &mut base, &mut len);
        libc::pthread_attr_destroy(&mut attr);
        if rc == 0 {
            base
        } else {
            std::ptr::null_mut()
        }
    }
}
