//! Per-thread observability gate.
//!
//! The gate is the only defense against the recorder observing itself:
//! every replacement body calls back into intercepted functions (allocation,
//! time, file IO), and with the gate up those calls would recursively record
//! events without bound. The interposition layer therefore drops the gate
//! for the whole duration of every replacement body.
//!
//! A fresh thread starts with the gate down; only the thread-creation
//! trampoline and the program-entry wrapper raise it.

use std::cell::Cell;

use libc::c_int;


thread_local! {
    // Const-initialized: no lazy registration and no destructor, so the
    // gate can be read from inside an allocator call at any point of a
    // thread's life.
    static OBSERVE: Cell<bool> = const { Cell::new(false) };
}

pub fn enable() {
    OBSERVE.with(|cell| cell.set(true));
}

pub fn disable() {
    OBSERVE.with(|cell| cell.set(false));
}

pub fn observing() -> bool {
    OBSERVE.with(Cell::get)
}

#[no_mangle]
pub extern "C" fn mem_trace_enable() {
    enable();
}

#[no_mangle]
pub extern "C" fn mem_trace_disable() {
    disable();
}

#[no_mangle]
pub extern "C" fn mem_trace_observing() -> c_int {
    observing() as c_int
}
