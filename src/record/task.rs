use std::fmt::Write as _;

use libc::{c_long, c_void, pid_t};

use super::{put_ptr, Row};

/// Start-routine pack built by the `pthread_create` wrapper and completed
/// by the trampoline once it runs on the new thread's stack.
///
/// Only the first two slots reach the log; the creator and stack base stay
/// available to in-process consumers of the event.
#[derive(Clone, Copy, Debug)]
pub struct ThreadPack {
    pub start: *mut c_void,
    pub arg: *mut c_void,
    pub creator: pid_t,
    pub stack_base: *mut c_void,
}

impl ThreadPack {
    pub(crate) fn columns(&self, row: &mut Row) {
        put_ptr(row, self.start);
        row.push(',');
        put_ptr(row, self.arg);
    }
}

/// Snapshot of the caller's `clone_args`. Mirrors the kernel struct layout;
/// callers running against older kernels pass a shorter struct, which leaves
/// the trailing fields zero.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub set_tid: u64,
    pub set_tid_size: u64,
    pub cgroup: u64,
}

/// `clone3(args, size) -> ret`, recorded on the parent side only.
#[derive(Clone, Debug)]
pub struct Clone3 {
    pub args: CloneArgs,
    pub size: usize,
    pub ret: c_long,
}

impl Clone3 {
    pub(crate) fn columns(&self, row: &mut Row) {
        let a = &self.args;
        let _ = write!(
            row,
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            a.flags,
            a.pidfd,
            a.child_tid,
            a.parent_tid,
            a.exit_signal,
            a.stack,
            a.stack_size,
            a.tls,
            a.set_tid,
            a.set_tid_size,
            a.cgroup,
            self.size,
            self.ret,
        );
    }
}
