//! Generic `syscall(2)` dispatch.
//!
//! The exported `syscall` is gated like every other interception; while
//! observing, the raw number indexes a listener table and a registered
//! listener takes over the call. Unlisted numbers (and everything when the
//! gate is down) go straight to the real implementation.

use libc::c_long;

use crate::queue;
use crate::record::{Clone3, CloneArgs, Payload};

use super::intercept;

/// Raw `syscall(2)` entry. The real symbol is variadic; at most six
/// argument registers reach a system call, and a fixed six-slot signature
/// receives them unchanged on every supported ABI.
pub type RealSyscall =
    unsafe extern "C" fn(c_long, c_long, c_long, c_long, c_long, c_long, c_long) -> c_long;

/// A listener owns one observed system call: it makes the real call and
/// reports what it saw.
pub type Listener = unsafe fn(real: RealSyscall, num: c_long, args: [c_long; 6]) -> c_long;

/// One slot per syscall number the table can listen on.
pub const LISTENER_SLOTS: usize = 470;

/// Static registration, fixed at build time. `clone3` is the only listener
/// today.
pub static LISTENERS: [Option<Listener>; LISTENER_SLOTS] = {
    let mut table: [Option<Listener>; LISTENER_SLOTS] = [None; LISTENER_SLOTS];
    table[libc::SYS_clone3 as usize] = Some(clone3_listener as Listener);
    table
};

unsafe fn new_syscall(
    real: RealSyscall,
    num: c_long,
    a1: c_long,
    a2: c_long,
    a3: c_long,
    a4: c_long,
    a5: c_long,
    a6: c_long,
) -> c_long {
    let listener = usize::try_from(num)
        .ok()
        .and_then(|num| LISTENERS.get(num))
        .copied()
        .flatten();
    match listener {
        Some(listener) => listener(real, num, [a1, a2, a3, a4, a5, a6]),
        None => real(num, a1, a2, a3, a4, a5, a6),
    }
}
intercept!(fn syscall(num: c_long, a1: c_long, a2: c_long, a3: c_long, a4: c_long, a5: c_long, a6: c_long) -> c_long => new_syscall);

/// `clone3` hands the kernel a `clone_args` struct; the event snapshots it
/// together with the declared size and the result. Only a positive return
/// (the parent side) reports: the child rebuilds its own recorder on exec.
pub(crate) unsafe fn clone3_listener(real: RealSyscall, num: c_long, args: [c_long; 6]) -> c_long {
    let ret = real(num, args[0], args[1], args[2], args[3], args[4], args[5]);
    if ret > 0 {
        let cl_args = args[0] as *const u8;
        let size = args[1] as usize;
        let mut snapshot = CloneArgs::default();
        if !cl_args.is_null() {
            let take = size.min(std::mem::size_of::<CloneArgs>());
            std::ptr::copy_nonoverlapping(cl_args, (&mut snapshot as *mut CloneArgs).cast(), take);
        }
        queue::push_event(Payload::Clone3(Clone3 {
            args: snapshot,
            size,
            ret,
        }));
    }
    ret
}
