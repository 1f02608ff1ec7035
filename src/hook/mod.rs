//! Interposition harness and the intercepted entry points.
//!
//! For every intercepted symbol the harness exports a function of the same
//! name and signature, which the dynamic linker binds ahead of the C
//! library. The exported wrapper resolves the displaced implementation
//! lazily through `RTLD_NEXT` and dispatches on the calling thread's gate:
//! gate up means the replacement body runs (with the gate dropped for its
//! duration), gate down means the call passes through untouched.
//!
//! The replacement bodies are ordinary functions taking the real
//! implementation as their first argument; the `intercept*` macros generate
//! only the exported wrapper around them.

use std::cell::Cell;
use std::ptr::null_mut;
#[cfg(not(test))]
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_int, c_void, off_t, pid_t};

use crate::ffi;
use crate::gate;
use crate::history;
use crate::queue;
use crate::record::{Calloc, CopyCall, Kind, Malloc, Mmap, Munmap, Payload, Realloc, ThreadPack};

pub mod sys;

#[cfg(test)]
mod test;

/// Resolves and caches the next occurrence of `$name` in the dynamic
/// loader's search order, typed as `$ty`. Racing resolutions are benign:
/// every racer arrives at the same address.
macro_rules! real {
    ($name:ident: $ty:ty) => {{
        static REAL: std::sync::atomic::AtomicPtr<libc::c_void> =
            std::sync::atomic::AtomicPtr::new(std::ptr::null_mut());
        let mut sym = REAL.load(std::sync::atomic::Ordering::Relaxed);
        if sym.is_null() {
            sym = $crate::ffi::resolve(concat!(stringify!($name), "\0"));
            REAL.store(sym, std::sync::atomic::Ordering::Relaxed);
        }
        std::mem::transmute::<*mut libc::c_void, $ty>(sym)
    }};
}
pub(crate) use real;

/// Value-returning interception, gated.
macro_rules! intercept {
    (fn $name:ident($($arg:ident: $ty:ty),* $(,)?) -> $ret:ty => $new:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name($($arg: $ty),*) -> $ret {
            let real = $crate::hook::real!($name: unsafe extern "C" fn($($ty),*) -> $ret);
            if $crate::gate::observing() {
                $crate::gate::disable();
                let out = $new(real, $($arg),*);
                $crate::gate::enable();
                out
            } else {
                real($($arg),*)
            }
        }
    };
}
pub(crate) use intercept;

/// Void interception, gated. Same dispatch as [`intercept!`] without the
/// return plumbing.
#[cfg_attr(not(test), allow(unused_macros))]
macro_rules! intercept_void {
    (fn $name:ident($($arg:ident: $ty:ty),* $(,)?) => $new:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name($($arg: $ty),*) {
            let real = $crate::hook::real!($name: unsafe extern "C" fn($($ty),*));
            if $crate::gate::observing() {
                $crate::gate::disable();
                $new(real, $($arg),*);
                $crate::gate::enable();
            } else {
                real($($arg),*);
            }
        }
    };
}
#[cfg(test)]
pub(crate) use intercept_void;

/// The replacement body runs no matter where the gate stands; the gate is
/// still dropped for its duration and put back the way it was found.
#[cfg_attr(not(test), allow(unused_macros))]
macro_rules! intercept_always {
    (fn $name:ident($($arg:ident: $ty:ty),* $(,)?) -> $ret:ty => $new:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name($($arg: $ty),*) -> $ret {
            let real = $crate::hook::real!($name: unsafe extern "C" fn($($ty),*) -> $ret);
            let was_observing = $crate::gate::observing();
            $crate::gate::disable();
            let out = $new(real, $($arg),*);
            if was_observing {
                $crate::gate::enable();
            }
            out
        }
    };
}
#[cfg(test)]
pub(crate) use intercept_always;

/// Interception of functions that never return. The gate is dropped
/// unconditionally and the replacement body must end in the real call.
macro_rules! intercept_noreturn {
    (fn $name:ident($($arg:ident: $ty:ty),* $(,)?) => $new:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name($($arg: $ty),*) -> ! {
            let real = $crate::hook::real!($name: unsafe extern "C" fn($($ty),*) -> !);
            $crate::gate::disable();
            $new(real, $($arg),*)
        }
    };
}
pub(crate) use intercept_noreturn;

// ---------------------------------------------------------------------------
// Allocator bootstrap.
//
// Resolving the real allocator goes through dlsym, and dlsym itself may ask
// for memory (older C libraries allocate their error buffer on first use).
// Those early requests are served from a fixed arena so the resolution can
// finish; anything inside the arena is never handed to the real free.

const ARENA_LEN: usize = 4096;

#[repr(align(16))]
struct Arena(std::cell::UnsafeCell<[u8; ARENA_LEN]>);

// Handed out in disjoint 16-byte-aligned chunks, each written by exactly
// one owner.
unsafe impl Sync for Arena {}

static ARENA: Arena = Arena(std::cell::UnsafeCell::new([0; ARENA_LEN]));
static ARENA_USED: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
}

fn arena_alloc(len: usize) -> *mut c_void {
    let len = (len + 15) & !15;
    let at = ARENA_USED.fetch_add(len, Ordering::Relaxed);
    if at + len > ARENA_LEN {
        return null_mut();
    }
    unsafe { ARENA.0.get().cast::<u8>().add(at).cast() }
}

fn arena_owns(ptr: *mut c_void) -> bool {
    let base = ARENA.0.get() as usize;
    (base..base + ARENA_LEN).contains(&(ptr as usize))
}

fn resolve_guarded<T>(resolve: impl FnOnce() -> T) -> T {
    RESOLVING.with(|cell| cell.set(true));
    let real = resolve();
    RESOLVING.with(|cell| cell.set(false));
    real
}

// ---------------------------------------------------------------------------
// Allocator entry points. Hand-written wrappers: same dispatch as the
// macros, plus the bootstrap arena on the resolution path.

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    if RESOLVING.with(Cell::get) {
        return arena_alloc(size);
    }
    let real =
        resolve_guarded(|| unsafe { real!(malloc: unsafe extern "C" fn(usize) -> *mut c_void) });
    if gate::observing() {
        gate::disable();
        let out = new_malloc(real, size);
        gate::enable();
        out
    } else {
        real(size)
    }
}

#[no_mangle]
pub unsafe extern "C" fn calloc(members: usize, member_size: usize) -> *mut c_void {
    if RESOLVING.with(Cell::get) {
        // The arena is zero-filled and never recycled.
        return arena_alloc(members.wrapping_mul(member_size));
    }
    let real = resolve_guarded(|| unsafe {
        real!(calloc: unsafe extern "C" fn(usize, usize) -> *mut c_void)
    });
    if gate::observing() {
        gate::disable();
        let out = new_calloc(real, members, member_size);
        gate::enable();
        out
    } else {
        real(members, member_size)
    }
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if arena_owns(ptr) {
        return;
    }
    let real = resolve_guarded(|| unsafe { real!(free: unsafe extern "C" fn(*mut c_void)) });
    if gate::observing() {
        gate::disable();
        new_free(real, ptr);
        gate::enable();
    } else {
        real(ptr);
    }
}

unsafe fn new_malloc(real: unsafe extern "C" fn(usize) -> *mut c_void, size: usize) -> *mut c_void {
    let ret = real(size);
    let time_ns = ffi::clock_realtime_ns();
    queue::push_event(Payload::Malloc(Malloc { size, ret }));
    history::add_event(ffi::gettid(), ret as usize, Kind::Malloc, time_ns, 0, size);
    ret
}

unsafe fn new_calloc(
    real: unsafe extern "C" fn(usize, usize) -> *mut c_void,
    members: usize,
    member_size: usize,
) -> *mut c_void {
    let ret = real(members, member_size);
    let time_ns = ffi::clock_realtime_ns();
    let call = Calloc {
        members,
        member_size,
        ret,
    };
    let total = call.total();
    queue::push_event(Payload::Calloc(call));
    history::add_event(ffi::gettid(), ret as usize, Kind::Calloc, time_ns, 0, total);
    ret
}

// The one body that observes before the real call: afterwards the pointer
// would already be dead.
unsafe fn new_free(real: unsafe extern "C" fn(*mut c_void), ptr: *mut c_void) {
    let time_ns = ffi::clock_realtime_ns();
    queue::push_event(Payload::Free(ptr));
    history::add_event(ffi::gettid(), ptr as usize, Kind::Free, time_ns, 0, 0);
    real(ptr);
}

unsafe fn new_realloc(
    real: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
    orig: *mut c_void,
    new_size: usize,
) -> *mut c_void {
    let ret = real(orig, new_size);
    let time_ns = ffi::clock_realtime_ns();
    queue::push_event(Payload::Realloc(Realloc {
        orig,
        new_size,
        ret,
    }));
    history::add_event(
        ffi::gettid(),
        ret as usize,
        Kind::Realloc,
        time_ns,
        orig as usize,
        new_size,
    );
    ret
}
intercept!(fn realloc(orig: *mut c_void, new_size: usize) -> *mut c_void => new_realloc);

// ---------------------------------------------------------------------------
// Mapping entry points.

unsafe fn new_mmap(
    real: unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, off_t) -> *mut c_void,
    addr: *mut c_void,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let ret = real(addr, len, prot, flags, fd, offset);
    let time_ns = ffi::clock_realtime_ns();
    queue::push_event(Payload::Mmap(Mmap {
        addr,
        len,
        prot,
        flags,
        fd,
        offset,
        ret,
    }));
    // A failed mapping has no address to remember.
    if ret != libc::MAP_FAILED {
        history::add_event(ffi::gettid(), ret as usize, Kind::Mmap, time_ns, 0, len);
    }
    ret
}
intercept!(fn mmap(addr: *mut c_void, len: usize, prot: c_int, flags: c_int, fd: c_int, offset: off_t) -> *mut c_void => new_mmap);

unsafe fn new_munmap(
    real: unsafe extern "C" fn(*mut c_void, usize) -> c_int,
    addr: *mut c_void,
    len: usize,
) -> c_int {
    let ret = real(addr, len);
    let time_ns = ffi::clock_realtime_ns();
    queue::push_event(Payload::Munmap(Munmap { addr, len, ret }));
    history::add_event(ffi::gettid(), addr as usize, Kind::Munmap, time_ns, 0, len);
    ret
}
intercept!(fn munmap(addr: *mut c_void, len: usize) -> c_int => new_munmap);

// ---------------------------------------------------------------------------
// Copy entry points. The destination is the tracked pointer, the source is
// the related one.

unsafe fn new_memcpy(
    real: unsafe extern "C" fn(*mut c_void, *const c_void, usize) -> *mut c_void,
    dest: *mut c_void,
    src: *const c_void,
    n: usize,
) -> *mut c_void {
    let ret = real(dest, src, n);
    let time_ns = ffi::clock_realtime_ns();
    queue::push_event(Payload::Memcpy(CopyCall { dest, src, n }));
    history::add_event(
        ffi::gettid(),
        dest as usize,
        Kind::Memcpy,
        time_ns,
        src as usize,
        n,
    );
    ret
}
intercept!(fn memcpy(dest: *mut c_void, src: *const c_void, n: usize) -> *mut c_void => new_memcpy);

unsafe fn new_strncpy(
    real: unsafe extern "C" fn(*mut c_char, *const c_char, usize) -> *mut c_char,
    dest: *mut c_char,
    src: *const c_char,
    n: usize,
) -> *mut c_char {
    let ret = real(dest, src, n);
    let time_ns = ffi::clock_realtime_ns();
    queue::push_event(Payload::Strncpy(CopyCall {
        dest: dest.cast(),
        src: src.cast(),
        n,
    }));
    history::add_event(
        ffi::gettid(),
        dest as usize,
        Kind::Strncpy,
        time_ns,
        src as usize,
        n,
    );
    ret
}
intercept!(fn strncpy(dest: *mut c_char, src: *const c_char, n: usize) -> *mut c_char => new_strncpy);

// ---------------------------------------------------------------------------
// Thread lifecycle.

type StartRoutine = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

/// Runs on the new thread in place of the user start routine: finishes the
/// pack, records the birth, runs the routine gated, records the death.
unsafe extern "C" fn thread_trampoline(raw: *mut c_void) -> *mut c_void {
    gate::disable();
    let mut pack = *Box::from_raw(raw as *mut ThreadPack);
    pack.stack_base = ffi::stack_base();
    let start: StartRoutine = std::mem::transmute(pack.start);
    let arg = pack.arg;
    queue::push_event(Payload::ThreadCreate(pack));
    gate::enable();

    let out = start(arg);

    gate::disable();
    queue::push_event(Payload::ThreadExit(out));
    out
}

unsafe fn new_pthread_create(
    real: unsafe extern "C" fn(
        *mut libc::pthread_t,
        *const libc::pthread_attr_t,
        StartRoutine,
        *mut c_void,
    ) -> c_int,
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    let pack = Box::new(ThreadPack {
        start: start as usize as *mut c_void,
        arg,
        creator: ffi::gettid(),
        stack_base: null_mut(),
    });
    real(thread, attr, thread_trampoline, Box::into_raw(pack).cast())
}
intercept!(fn pthread_create(thread: *mut libc::pthread_t, attr: *const libc::pthread_attr_t, start: StartRoutine, arg: *mut c_void) -> c_int => new_pthread_create);

unsafe fn new_pthread_exit(real: unsafe extern "C" fn(*mut c_void) -> !, value: *mut c_void) -> ! {
    queue::push_event(Payload::ThreadExit(value));
    history::clear_thread(ffi::gettid());
    // This thread never returns, so the drain must come down in an orderly
    // fashion before the C library tears the thread apart.
    queue::end_loop();
    real(value)
}
intercept_noreturn!(fn pthread_exit(value: *mut c_void) => new_pthread_exit);

unsafe fn new_exit(real: unsafe extern "C" fn(c_int) -> !, status: c_int) -> ! {
    queue::push_event(Payload::Exit(status));
    real(status)
}
intercept_noreturn!(fn exit(status: c_int) => new_exit);

// ---------------------------------------------------------------------------
// Fork family. Hand-written: the gate handling is asymmetric between the
// parent and child sides, which none of the macro shapes express.

/// The child comes back with the gate down and rebuilds its own recorder
/// (its constructor re-runs on exec); only the parent records the event and
/// keeps observing.
#[no_mangle]
pub unsafe extern "C" fn fork() -> pid_t {
    let real = real!(fork: unsafe extern "C" fn() -> pid_t);
    gate::disable();
    let pid = real();
    if pid > 0 {
        queue::push_event(Payload::Fork(pid));
        gate::enable();
    }
    pid
}

/// Like `fork`, but the child borrows the parent's address space until it
/// execs, so the drain worker is parked across the call.
#[no_mangle]
pub unsafe extern "C" fn vfork() -> pid_t {
    let real = real!(vfork: unsafe extern "C" fn() -> pid_t);
    gate::disable();
    queue::end_loop();
    let pid = real();
    if pid > 0 {
        queue::restart_loop();
        queue::push_event(Payload::Fork(pid));
        gate::enable();
    }
    pid
}

// ---------------------------------------------------------------------------
// Program entry.

#[cfg(not(test))]
type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;
#[cfg(not(test))]
type StartHook = Option<unsafe extern "C" fn()>;

#[cfg(not(test))]
static REAL_MAIN: AtomicPtr<c_void> = AtomicPtr::new(null_mut());

/// Startup trampoline hook: the loader hands us the target's `main`, we
/// stash it and give the real trampoline our wrapper instead. Everything
/// else passes through untouched.
#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn __libc_start_main(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: StartHook,
    fini: StartHook,
    rtld_fini: StartHook,
    stack_end: *mut c_void,
) -> c_int {
    REAL_MAIN.store(main as usize as *mut c_void, Ordering::Relaxed);
    let real = real!(__libc_start_main: unsafe extern "C" fn(MainFn, c_int, *mut *mut c_char, StartHook, StartHook, StartHook, *mut c_void) -> c_int);
    real(new_main, argc, argv, init, fini, rtld_fini, stack_end)
}

/// Stand-in for the target's `main`: the first observed thread of the
/// process.
#[cfg(not(test))]
unsafe extern "C" fn new_main(
    argc: c_int,
    argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    queue::push_event(Payload::ThreadCreate(ThreadPack {
        start: null_mut(),
        arg: argv.cast(),
        creator: ffi::gettid(),
        stack_base: ffi::stack_base(),
    }));
    gate::enable();

    let main: MainFn = std::mem::transmute(REAL_MAIN.load(Ordering::Relaxed));
    let status = main(argc, argv, envp);

    gate::disable();
    queue::push_event(Payload::ThreadExit(status as isize as *mut c_void));
    status
}
