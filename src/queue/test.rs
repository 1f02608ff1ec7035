use super::*;
use crate::record::{Kind, Malloc};
use crate::testutil::serial;

fn drain_pending() {
    for _ in steal().0 {}
}

fn exit_codes(drained: Drained) -> Vec<i32> {
    drained
        .filter_map(|event| match event.payload {
            Payload::Exit(code) => Some(code),
            _ => None,
        })
        .collect()
}

#[test]
fn test_preserves_push_order() {
    let _guard = serial();
    drain_pending();

    push_event(Payload::Exit(1));
    push_event(Payload::Exit(2));
    push_event(Payload::Exit(3));

    let (drained, _) = steal();
    assert_eq!(exit_codes(drained), [1, 2, 3]);
}

#[test]
fn test_steal_empties_the_queue() {
    let _guard = serial();
    drain_pending();

    push_event(Payload::Exit(7));
    push_event(Payload::Exit(8));
    let (drained, _) = steal();
    assert_eq!(drained.count(), 2);

    // Loop flag is down, so this returns immediately and empty.
    let (drained, _) = steal();
    assert_eq!(drained.count(), 0);
}

#[test]
fn test_events_carry_tid_and_time() {
    let _guard = serial();
    drain_pending();

    push_event(Payload::Malloc(Malloc {
        size: 8,
        ret: 0x100 as *mut _,
    }));
    let (drained, _) = steal();
    let events: Vec<_> = drained.collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tid, crate::ffi::gettid());
    assert!(events[0].time_ns > 0);
    assert_eq!(events[0].payload.kind(), Kind::Malloc);
}

#[test]
fn test_origin_pinned_by_first_event() {
    let _guard = serial();
    drain_pending();

    push_event(Payload::Exit(0));
    let (drained, first_origin) = steal();
    let _ = drained.count();
    assert!(first_origin > 0);

    push_event(Payload::Exit(0));
    let (drained, second_origin) = steal();
    let _ = drained.count();
    assert_eq!(first_origin, second_origin);

    // And it was published for descendants.
    assert_eq!(
        crate::ffi::env_ns(crate::ffi::ORIGIN_TIME_ENV),
        Some(first_origin)
    );
}

#[test]
fn test_interleaved_producers_keep_thread_order() {
    let _guard = serial();
    drain_pending();

    let spawn = |base: i32| {
        std::thread::spawn(move || {
            for i in 0..50 {
                push_event(Payload::Exit(base + i));
            }
        })
    };
    let a = spawn(1_000);
    let b = spawn(2_000);
    a.join().unwrap();
    b.join().unwrap();

    let (drained, _) = steal();
    let codes = exit_codes(drained);
    assert_eq!(codes.len(), 100);
    for base in [1_000, 2_000] {
        let per_thread: Vec<i32> = codes
            .iter()
            .copied()
            .filter(|code| code / 1_000 == base / 1_000)
            .collect();
        assert_eq!(per_thread, (0..50).map(|i| base + i).collect::<Vec<_>>());
    }
}

#[test]
fn test_end_loop_without_worker_is_safe() {
    let _guard = serial();
    end_loop();
    end_loop();
}
