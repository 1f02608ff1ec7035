//! Per-thread, per-pointer event history.
//!
//! A two-level map from kernel thread id to pointer to the ordered list of
//! events that named that pointer. Updated by the replacement bodies on
//! every allocation-related interception, and readable in-process through
//! the exported `mem_trace_history_*` surface.
//!
//! One process-wide mutex guards the map. It is independent of the queue
//! lock and the two are never held together; the map is nowhere near hot
//! enough to warrant more.

use std::collections::HashMap;
use std::sync::Mutex;

use libc::{c_int, c_void, pid_t};

use crate::ffi::{fatal, Fatal};
use crate::lock;
use crate::record::Kind;


/// One entry of a pointer's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HistoryRecord {
    pub time_ns: u64,
    pub kind: Kind,
    /// Second pointer of the event, when there is one: the original
    /// allocation for `realloc`, the source for `memcpy`/`strncpy`.
    pub related: usize,
    pub size: usize,
}

/// C-visible copy of a [`HistoryRecord`].
#[repr(C)]
pub struct HistoryEntry {
    pub time_ns: u64,
    pub kind: c_int,
    pub related: *mut c_void,
    pub size: usize,
}

type PointerMap = HashMap<usize, Vec<HistoryRecord>>;

static MAP: Mutex<Option<HashMap<pid_t, PointerMap>>> = Mutex::new(None);

/// Brings the map up. Idempotent for the process.
pub fn init() {
    let mut map = lock(&MAP);
    if map.is_none() {
        *map = Some(HashMap::new());
    }
}

/// Tears the map down. Lookups after this report nothing until `init` runs
/// again.
pub fn destroy() {
    *lock(&MAP) = None;
}

/// Appends one record under `(tid, ptr)`. Null pointers are not tracked.
pub fn add_event(tid: pid_t, ptr: usize, kind: Kind, time_ns: u64, related: usize, size: usize) {
    if ptr == 0 {
        return;
    }
    if let Some(map) = lock(&MAP).as_mut() {
        map.entry(tid)
            .or_default()
            .entry(ptr)
            .or_default()
            .push(HistoryRecord {
                time_ns,
                kind,
                related,
                size,
            });
    }
}

/// The full history of `(tid, ptr)` in insertion order, or `None` if the
/// pair was never recorded.
pub fn history(tid: pid_t, ptr: usize) -> Option<Vec<HistoryRecord>> {
    if ptr == 0 {
        return None;
    }
    lock(&MAP)
        .as_ref()?
        .get(&tid)?
        .get(&ptr)
        .cloned()
}

/// Drops the `(tid, ptr)` entry, and the thread's slot once it empties.
pub fn remove(tid: pid_t, ptr: usize) {
    if ptr == 0 {
        return;
    }
    if let Some(map) = lock(&MAP).as_mut() {
        if let Some(pointers) = map.get_mut(&tid) {
            pointers.remove(&ptr);
            if pointers.is_empty() {
                map.remove(&tid);
            }
        }
    }
}

/// Drops everything recorded for `tid`.
pub fn clear_thread(tid: pid_t) {
    if let Some(map) = lock(&MAP).as_mut() {
        map.remove(&tid);
    }
}

/// Number of tracked `(thread, pointer)` pairs, not of records.
pub fn len() -> usize {
    match lock(&MAP).as_ref() {
        Some(map) => map.values().map(HashMap::len).sum(),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn mem_trace_history_init() {
    init();
}

#[no_mangle]
pub extern "C" fn mem_trace_history_destroy() {
    destroy();
}

/// Appends one record from C. Aborts on a kind code outside the closed set;
/// an unclassifiable event would poison the trace.
#[no_mangle]
pub unsafe extern "C" fn mem_trace_history_add(
    tid: pid_t,
    ptr: *mut c_void,
    kind: c_int,
    time_ns: u64,
    related: *mut c_void,
    size: usize,
) {
    let Some(kind) = Kind::from_raw(kind) else {
        fatal(Fatal::UnknownKind(kind));
    };
    add_event(tid, ptr as usize, kind, time_ns, related as usize, size);
}

/// Returns the total record count for `(tid, ptr)`, or -1 if there is no
/// entry. When `out` is non-null, copies up to `max` records into it,
/// oldest first.
#[no_mangle]
pub unsafe extern "C" fn mem_trace_history_get(
    tid: pid_t,
    ptr: *mut c_void,
    out: *mut HistoryEntry,
    max: c_int,
) -> c_int {
    let Some(records) = history(tid, ptr as usize) else {
        return -1;
    };
    if !out.is_null() && max > 0 {
        let take = records.len().min(max as usize);
        for (i, rec) in records[..take].iter().enumerate() {
            out.add(i).write(HistoryEntry {
                time_ns: rec.time_ns,
                kind: rec.kind as c_int,
                related: rec.related as *mut c_void,
                size: rec.size,
            });
        }
    }
    records.len() as c_int
}

#[no_mangle]
pub unsafe extern "C" fn mem_trace_history_remove(tid: pid_t, ptr: *mut c_void) {
    remove(tid, ptr as usize);
}

#[no_mangle]
pub extern "C" fn mem_trace_history_clear_thread(tid: pid_t) {
    clear_thread(tid);
}

#[no_mangle]
pub extern "C" fn mem_trace_history_len() -> usize {
    len()
}
