use std::ptr::{null, null_mut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use libc::{c_long, c_uint, c_void};

use super::sys;
use super::*;
use crate::record::CloneArgs;
use crate::testutil::serial;

fn drain_pending() {
    for _ in queue::steal().0 {}
}

fn drained() -> Vec<crate::record::Event> {
    queue::steal().0.collect()
}

// ---------------------------------------------------------------------------
// Wrapper template contracts, exercised on symbols that are harmless to
// interpose inside the test binary.

static GATED_CALLS: AtomicU32 = AtomicU32::new(0);
static GATED_SAW_GATE_UP: AtomicBool = AtomicBool::new(false);
static GATED_LOCK: Mutex<()> = Mutex::new(());

unsafe fn new_getppid(real: unsafe extern "C" fn() -> libc::pid_t) -> libc::pid_t {
    GATED_CALLS.fetch_add(1, Ordering::SeqCst);
    GATED_SAW_GATE_UP.store(gate::observing(), Ordering::SeqCst);
    real()
}
intercept!(fn getppid() -> libc::pid_t => new_getppid);

#[test]
fn test_gated_wrapper_passes_through_when_gate_down() {
    let _lock = GATED_LOCK.lock().unwrap();
    assert!(!gate::observing());
    let before = GATED_CALLS.load(Ordering::SeqCst);
    let ppid = unsafe { getppid() };
    assert!(ppid > 0);
    assert_eq!(GATED_CALLS.load(Ordering::SeqCst), before);
}

#[test]
fn test_gated_wrapper_runs_body_with_gate_dropped() {
    let _lock = GATED_LOCK.lock().unwrap();
    gate::enable();
    let before = GATED_CALLS.load(Ordering::SeqCst);
    let ppid = unsafe { getppid() };
    // The wrapper puts the gate back up before returning.
    let restored = gate::observing();
    gate::disable();

    assert!(ppid > 0);
    assert_eq!(GATED_CALLS.load(Ordering::SeqCst), before + 1);
    assert!(!GATED_SAW_GATE_UP.load(Ordering::SeqCst));
    assert!(restored);
}

static ALWAYS_CALLS: AtomicU32 = AtomicU32::new(0);
static ALWAYS_SAW_GATE_UP: AtomicBool = AtomicBool::new(false);

unsafe fn new_getuid(real: unsafe extern "C" fn() -> libc::uid_t) -> libc::uid_t {
    ALWAYS_CALLS.fetch_add(1, Ordering::SeqCst);
    ALWAYS_SAW_GATE_UP.store(gate::observing(), Ordering::SeqCst);
    real()
}
intercept_always!(fn getuid() -> libc::uid_t => new_getuid);

#[test]
fn test_always_wrapper_runs_regardless_of_gate() {
    let before = ALWAYS_CALLS.load(Ordering::SeqCst);
    let _ = unsafe { getuid() };
    assert!(ALWAYS_CALLS.load(Ordering::SeqCst) > before);
    // Gate was down going in and stays down.
    assert!(!gate::observing());

    gate::enable();
    let before = ALWAYS_CALLS.load(Ordering::SeqCst);
    let _ = unsafe { getuid() };
    let restored = gate::observing();
    gate::disable();
    assert!(ALWAYS_CALLS.load(Ordering::SeqCst) > before);
    assert!(!ALWAYS_SAW_GATE_UP.load(Ordering::SeqCst));
    assert!(restored);
}

static VOID_CALLS: AtomicU32 = AtomicU32::new(0);

unsafe fn new_srand(real: unsafe extern "C" fn(c_uint), seed: c_uint) {
    VOID_CALLS.fetch_add(1, Ordering::SeqCst);
    real(seed);
}
intercept_void!(fn srand(seed: c_uint) => new_srand);

#[test]
fn test_void_wrapper_is_gated() {
    let before = VOID_CALLS.load(Ordering::SeqCst);
    unsafe { srand(7) };
    assert_eq!(VOID_CALLS.load(Ordering::SeqCst), before);

    gate::enable();
    unsafe { srand(7) };
    gate::disable();
    assert_eq!(VOID_CALLS.load(Ordering::SeqCst), before + 1);
}

// ---------------------------------------------------------------------------
// Replacement bodies end to end: exported symbol -> queue + history.

#[test]
fn test_malloc_records_event_and_history() {
    let _guard = serial();
    drain_pending();
    history::init();
    let tid = ffi::gettid();

    gate::enable();
    let ptr = unsafe { malloc(24) };
    gate::disable();
    assert!(!ptr.is_null());

    let ours: Vec<_> = drained().into_iter().filter(|e| e.tid == tid).collect();
    assert_eq!(ours.len(), 1);
    match &ours[0].payload {
        Payload::Malloc(call) => {
            assert_eq!(call.size, 24);
            assert_eq!(call.ret, ptr);
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    let records = history::history(tid, ptr as usize).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, Kind::Malloc);
    assert_eq!(records[0].size, 24);

    history::clear_thread(tid);
    unsafe { free(ptr) };
}

#[test]
fn test_calloc_records_total() {
    let _guard = serial();
    drain_pending();
    history::init();
    let tid = ffi::gettid();

    gate::enable();
    let ptr = unsafe { calloc(4, 8) };
    gate::disable();
    assert!(!ptr.is_null());

    let ours: Vec<_> = drained().into_iter().filter(|e| e.tid == tid).collect();
    assert_eq!(ours.len(), 1);
    match &ours[0].payload {
        Payload::Calloc(call) => {
            assert_eq!((call.members, call.member_size), (4, 8));
            assert_eq!(call.ret, ptr);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    let records = history::history(tid, ptr as usize).unwrap();
    assert_eq!(records[0].size, 32);

    history::clear_thread(tid);
    unsafe { free(ptr) };
}

#[test]
fn test_free_observes_before_the_call() {
    let _guard = serial();
    drain_pending();
    history::init();
    let tid = ffi::gettid();

    // Allocated with the gate down: the allocation itself is not recorded.
    let ptr = unsafe { malloc(16) };
    gate::enable();
    unsafe { free(ptr) };
    gate::disable();

    let ours: Vec<_> = drained().into_iter().filter(|e| e.tid == tid).collect();
    assert_eq!(ours.len(), 1);
    assert!(matches!(ours[0].payload, Payload::Free(p) if p == ptr));

    let records = history::history(tid, ptr as usize).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, Kind::Free);

    history::clear_thread(tid);
}

#[test]
fn test_realloc_relates_old_and_new() {
    let _guard = serial();
    drain_pending();
    history::init();
    let tid = ffi::gettid();

    let orig = unsafe { malloc(8) };
    gate::enable();
    let grown = unsafe { realloc(orig, 64) };
    gate::disable();
    assert!(!grown.is_null());

    let ours: Vec<_> = drained().into_iter().filter(|e| e.tid == tid).collect();
    assert_eq!(ours.len(), 1);
    match &ours[0].payload {
        Payload::Realloc(call) => {
            assert_eq!(call.orig, orig);
            assert_eq!(call.new_size, 64);
            assert_eq!(call.ret, grown);
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    let records = history::history(tid, grown as usize).unwrap();
    assert_eq!(records[0].kind, Kind::Realloc);
    assert_eq!(records[0].related, orig as usize);

    history::clear_thread(tid);
    unsafe { free(grown) };
}

#[test]
fn test_mmap_munmap_share_a_history_key() {
    let _guard = serial();
    drain_pending();
    history::init();
    let tid = ffi::gettid();

    gate::enable();
    let ptr = unsafe {
        mmap(
            null_mut(),
            4096,
            libc::PROT_READ,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    let rc = unsafe { munmap(ptr, 4096) };
    gate::disable();
    assert_ne!(ptr, libc::MAP_FAILED);
    assert_eq!(rc, 0);

    let ours: Vec<_> = drained().into_iter().filter(|e| e.tid == tid).collect();
    assert_eq!(ours.len(), 2);
    match &ours[0].payload {
        Payload::Mmap(call) => {
            assert_eq!(call.len, 4096);
            assert_eq!(call.ret, ptr);
            assert_eq!(call.fd, -1);
            assert!(!call.inaccessible());
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    assert!(matches!(&ours[1].payload, Payload::Munmap(call) if call.addr == ptr && call.ret == 0));

    let kinds: Vec<_> = history::history(tid, ptr as usize)
        .unwrap()
        .iter()
        .map(|r| r.kind)
        .collect();
    assert_eq!(kinds, [Kind::Mmap, Kind::Munmap]);

    history::clear_thread(tid);
}

#[test]
fn test_memcpy_tracks_destination_with_related_source() {
    let _guard = serial();
    drain_pending();
    history::init();
    let tid = ffi::gettid();

    let src = [7u8; 16];
    let mut dst = [0u8; 16];
    gate::enable();
    let ret = unsafe { memcpy(dst.as_mut_ptr().cast(), src.as_ptr().cast(), 16) };
    gate::disable();

    assert_eq!(ret, dst.as_mut_ptr().cast());
    assert_eq!(dst, src);

    let ours: Vec<_> = drained().into_iter().filter(|e| e.tid == tid).collect();
    assert_eq!(ours.len(), 1);
    assert!(matches!(&ours[0].payload, Payload::Memcpy(call) if call.n == 16));

    let records = history::history(tid, dst.as_ptr() as usize).unwrap();
    assert_eq!(records[0].kind, Kind::Memcpy);
    assert_eq!(records[0].related, src.as_ptr() as usize);

    history::clear_thread(tid);
}

#[test]
fn test_strncpy_copies_and_records() {
    let _guard = serial();
    drain_pending();
    history::init();
    let tid = ffi::gettid();

    let src = c"hi";
    let mut dst: [libc::c_char; 8] = [1; 8];
    gate::enable();
    let ret = unsafe { strncpy(dst.as_mut_ptr(), src.as_ptr(), 8) };
    gate::disable();

    assert_eq!(ret, dst.as_mut_ptr());
    assert_eq!(dst[0], b'h' as libc::c_char);
    assert_eq!(dst[1], b'i' as libc::c_char);
    // strncpy pads the rest with zeros.
    assert!(dst[2..].iter().all(|&b| b == 0));

    let ours: Vec<_> = drained().into_iter().filter(|e| e.tid == tid).collect();
    assert_eq!(ours.len(), 1);
    assert!(matches!(&ours[0].payload, Payload::Strncpy(call) if call.n == 8));

    history::clear_thread(tid);
}

unsafe extern "C" fn thread_body(arg: *mut c_void) -> *mut c_void {
    arg
}

#[test]
fn test_pthread_create_trampoline_records_lifecycle() {
    let _guard = serial();
    drain_pending();

    let creator = ffi::gettid();
    let mut handle: libc::pthread_t = 0;
    gate::enable();
    let rc = unsafe { pthread_create(&mut handle, null(), thread_body, 0xbeef as *mut _) };
    gate::disable();
    assert_eq!(rc, 0);

    let mut out: *mut c_void = null_mut();
    unsafe { libc::pthread_join(handle, &mut out) };
    assert_eq!(out as usize, 0xbeef);

    let events = drained();
    let born = events
        .iter()
        .find_map(|e| match &e.payload {
            Payload::ThreadCreate(pack) => Some((e.tid, *pack)),
            _ => None,
        })
        .expect("no thread_create event");
    let died = events
        .iter()
        .find_map(|e| match e.payload {
            Payload::ThreadExit(value) => Some((e.tid, value)),
            _ => None,
        })
        .expect("no thread_exit event");

    let (child_tid, pack) = born;
    assert_ne!(child_tid, creator);
    assert_eq!(pack.creator, creator);
    assert_eq!(pack.start as usize, thread_body as usize);
    assert_eq!(pack.arg as usize, 0xbeef);
    assert!(!pack.stack_base.is_null());

    assert_eq!(died.0, child_tid);
    assert_eq!(died.1 as usize, 0xbeef);
}

// ---------------------------------------------------------------------------
// Generic syscall dispatch.

#[test]
fn test_listener_table_registration() {
    assert_eq!(sys::LISTENERS.len(), sys::LISTENER_SLOTS);
    assert!(sys::LISTENERS[libc::SYS_clone3 as usize].is_some());
    let registered = sys::LISTENERS.iter().filter(|slot| slot.is_some()).count();
    assert_eq!(registered, 1);
}

#[test]
fn test_syscall_transparent_without_listener() {
    let _guard = serial();
    drain_pending();

    let direct = unsafe { sys::syscall(libc::SYS_gettid, 0, 0, 0, 0, 0, 0) };
    assert_eq!(direct, ffi::gettid() as c_long);

    gate::enable();
    let gated = unsafe { sys::syscall(libc::SYS_gettid, 0, 0, 0, 0, 0, 0) };
    gate::disable();
    assert_eq!(gated, direct);

    assert!(drained().is_empty());
}

unsafe extern "C" fn fake_clone3_parent(
    _num: c_long,
    _a1: c_long,
    _a2: c_long,
    _a3: c_long,
    _a4: c_long,
    _a5: c_long,
    _a6: c_long,
) -> c_long {
    777
}

unsafe extern "C" fn fake_clone3_child(
    _num: c_long,
    _a1: c_long,
    _a2: c_long,
    _a3: c_long,
    _a4: c_long,
    _a5: c_long,
    _a6: c_long,
) -> c_long {
    0
}

#[test]
fn test_clone3_listener_snapshots_parent_side() {
    let _guard = serial();
    drain_pending();

    let args = CloneArgs {
        flags: 0x0400_0011,
        exit_signal: 17,
        ..Default::default()
    };
    let raw = [
        &args as *const CloneArgs as c_long,
        std::mem::size_of::<CloneArgs>() as c_long,
        0,
        0,
        0,
        0,
    ];
    let ret = unsafe { sys::clone3_listener(fake_clone3_parent, libc::SYS_clone3, raw) };
    assert_eq!(ret, 777);

    let events = drained();
    assert_eq!(events.len(), 1);
    match &events[0].payload {
        Payload::Clone3(call) => {
            assert_eq!(call.args.flags, 0x0400_0011);
            assert_eq!(call.args.exit_signal, 17);
            assert_eq!(call.size, std::mem::size_of::<CloneArgs>());
            assert_eq!(call.ret, 777);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[test]
fn test_clone3_listener_silent_off_the_parent_side() {
    let _guard = serial();
    drain_pending();

    let args = CloneArgs::default();
    let raw = [
        &args as *const CloneArgs as c_long,
        std::mem::size_of::<CloneArgs>() as c_long,
        0,
        0,
        0,
        0,
    ];
    let ret = unsafe { sys::clone3_listener(fake_clone3_child, libc::SYS_clone3, raw) };
    assert_eq!(ret, 0);
    assert!(drained().is_empty());
}
