//! Runtime-injected recorder for memory and process-lifecycle events on Linux.
//!
//! Loading the shared object ahead of the C library interposes a fixed set of
//! allocation, mapping, copy and lifecycle entry points of an unmodified
//! target program:
//!
//! ```text
//! LD_PRELOAD=./libmem_event_trace.so ./some-program
//! ```
//!
//! Every intercepted call is captured with its arguments, return value,
//! timestamp and originating kernel thread, then handed to a worker that
//! serializes it into one CSV file per event kind under
//! `$LD_PRELOAD_LOG/<pid>/` (default `./logs/<pid>/`). All rows start with
//! `thread,time_ns`, where the time is relative to the process family's
//! first event; forked children inherit that origin through the
//! `LD_ORIGIN_TIME` environment variable, so their rows stay comparable to
//! the ancestor's.
//!
//! Observation is driven by a per-thread gate: it is raised when the target's
//! `main` starts and when a target-created thread body starts, and dropped
//! for the whole duration of every replacement body, so the recorder never
//! observes itself.
//!
//! Beside the log files, the library keeps an in-process history of every
//! pointer an observed thread touched. Target code (or a debugger) can query
//! it through the exported C surface:
//!
//! ```text
//! int n = mem_trace_history_get(tid, ptr, buf, max);  // -1 if unknown
//! ```
//!
//! Set `MEM_TRACE_DEBUG` to an `EnvFilter` expression to get the recorder's
//! own diagnostics on stderr.

pub mod ffi;
pub mod gate;
pub mod history;
pub mod hook;
#[cfg(not(test))]
mod lifecycle;
pub mod queue;
pub mod record;
pub mod sink;

/// Poison-tolerant lock: a panicking producer must not wedge the drain side.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
