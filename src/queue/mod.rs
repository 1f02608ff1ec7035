//! Thread-safe event queue and its drain worker.
//!
//! Producers are arbitrary target threads running replacement bodies; the
//! single consumer is a background worker that steals the whole pending
//! chain in one motion and hands each event to the sink. Producers only
//! wake the worker once a batch has built up, so a chatty target does not
//! pay a context switch per call.

use std::ptr::null_mut;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::ffi::{self, Fatal};
use crate::lock;
use crate::record::{Event, Payload};
use crate::sink;

#[cfg(test)]
mod test;

/// Producers wake the drain worker once this many events are pending.
const WAKE_BATCH: usize = 20;

struct Node {
    event: Event,
    next: Option<Box<Node>>,
}

struct Shared {
    first: Option<Box<Node>>,
    last: *mut Node,
    size: usize,
    /// Absolute nanosecond of the process family's first event. Zero until
    /// the first push (or until a forked child imports its ancestor's).
    origin: u64,
    keep_looping: bool,
}

// `last` always aims at the tail node owned by the `first` chain; the chain
// itself is plain owned data.
unsafe impl Send for Shared {}

struct Queue {
    shared: Mutex<Shared>,
    ready: Condvar,
}

static QUEUE: Lazy<Queue> = Lazy::new(|| Queue {
    shared: Mutex::new(Shared {
        first: None,
        last: null_mut(),
        size: 0,
        origin: 0,
        keep_looping: false,
    }),
    ready: Condvar::new(),
});

static WORKER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

/// Appends one event.
///
/// Runs with the calling thread's gate already down, so the allocations in
/// here go straight to the real allocator. The first event of the process
/// pins the time origin and publishes it for forked descendants.
pub fn push_event(payload: Payload) {
    let time_ns = ffi::clock_realtime_ns();
    let mut node = Box::new(Node {
        event: Event {
            time_ns,
            tid: ffi::gettid(),
            payload,
        },
        next: None,
    });
    let tail: *mut Node = &mut *node;

    let mut shared = lock(&QUEUE.shared);
    if shared.origin == 0 {
        shared.origin = time_ns;
        ffi::export_ns(ffi::ORIGIN_TIME_ENV, time_ns);
    }
    if shared.last.is_null() {
        shared.first = Some(node);
    } else {
        unsafe { (*shared.last).next = Some(node) };
    }
    shared.last = tail;
    shared.size += 1;
    if shared.size >= WAKE_BATCH {
        QUEUE.ready.notify_one();
    }
}

/// Adopts the origin inherited from a forking ancestor.
pub fn preset_origin(origin_ns: u64) {
    lock(&QUEUE.shared).origin = origin_ns;
}

/// A stolen chain, consumed front to back.
pub(crate) struct Drained {
    next: Option<Box<Node>>,
}

impl Iterator for Drained {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let node = self.next.take()?;
        let Node { event, next } = *node;
        self.next = next;
        Some(event)
    }
}

/// Detaches the whole pending chain. When the queue is empty and the loop
/// is live, parks on the condition variable first; any wakeup drains
/// whatever has accumulated by then.
pub(crate) fn steal() -> (Drained, u64) {
    let mut shared = lock(&QUEUE.shared);
    if shared.keep_looping && shared.first.is_none() {
        shared = QUEUE
            .ready
            .wait(shared)
            .unwrap_or_else(PoisonError::into_inner);
    }
    let first = shared.first.take();
    shared.last = null_mut();
    shared.size = 0;
    (Drained { next: first }, shared.origin)
}

/// One drain pass: steal everything pending and serialize it.
pub fn flush_events() {
    let (drained, origin) = steal();
    let mut sink = sink::global();
    for event in drained {
        sink.write_event(&event, origin);
    }
}

fn drain_loop() {
    debug!("drain worker up");
    loop {
        if !lock(&QUEUE.shared).keep_looping {
            break;
        }
        flush_events();
    }
    // Whatever arrived between the last steal and the flag flip.
    flush_events();
    debug!("drain worker down");
}

/// Stops the worker: clears the loop flag, wakes it, and joins. Safe to
/// call when no worker is running.
pub fn end_loop() {
    {
        let mut shared = lock(&QUEUE.shared);
        shared.keep_looping = false;
        QUEUE.ready.notify_one();
    }
    let handle = lock(&WORKER).take();
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

/// Starts a fresh worker bound to the drain loop.
pub fn restart_loop() {
    lock(&QUEUE.shared).keep_looping = true;
    let handle = std::thread::Builder::new()
        .name("mem-trace-drain".into())
        .spawn(drain_loop)
        .unwrap_or_else(|e| ffi::fatal(Fatal::Worker(e)));
    *lock(&WORKER) = Some(handle);
}
