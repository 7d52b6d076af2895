//! Flow-trap ("expect") behavior: installation from signature code, scored
//! matching at stream creation, and TTL expiry.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flowmon::rts::value::{pack_id, ValueType, FLAG_EXPORT};
use flowmon::rts::{Direction, Domain, RtsRuntime};

use common::{asm::Asm, dead_state, t4f_state_id, BundleBuilder};

const UDP: i8 = 17;

/// Bundle: a UDP stream whose first byte is 'X' runs code installing a
/// trap for `*:* -> 10.0.0.1:53/udp` with a 10 second TTL. When a later
/// stream hits the trap, the trap code publishes `trap.hit` and leaves
/// the TTL alone.
fn trap_bundle() -> Vec<u8> {
    let hit_id = pack_id(1, ValueType::String, FLAG_EXPORT);

    let program = Asm::new().halt();

    // trap-hit code: publish, then verdict 0 (keep ttl)
    let hit_pc = program.pc();
    let program = program.pstr("hit").store(hit_id).popb().pnum1(0).halt();

    // installer: expect(proto=17, saddr=*, sport=0, daddr=10.0.0.1,
    //                   dport=53, pc=hit_pc, ttl=10)
    let install_pc = program.pc();
    let program = program
        .pnum1(UDP)
        .pbin(&[])
        .pnum1(0)
        .pbin(&[10, 0, 0, 1])
        .pnum2(53)
        .pnum4(hit_pc as i32)
        .pnum1(10)
        .expect()
        .halt();

    let mut states = vec![dead_state(); 18];
    // protocol 17 entry state accepts 'X' and runs the installer
    states[17] = (t4f_state_id(1), b'X' as u16, b'X' as u16 + 1);

    BundleBuilder::new()
        .vars(2)
        .keys(&[("trap.hit", 1, 2)])
        .code(program.code)
        .ran_states(&states)
        .t4f(&[(0, 0), (0, 1)])
        .ftab(&[&[], &[install_pc]])
        .build()
}

fn hits_counter(runtime: &RtsRuntime) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let sink = hits.clone();
    runtime
        .subscribe(
            "trap.hit",
            Arc::new(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    hits
}

#[test]
fn trap_fires_on_matching_stream_create() {
    let runtime = Arc::new(RtsRuntime::new());
    runtime.load(Some(&trap_bundle())).unwrap();
    let hits = hits_counter(&runtime);

    let mut handle = runtime.handle_create().unwrap();

    // install the trap by scanning the trigger byte
    let mut installer = handle
        .stream_create(
            Domain::Inet,
            17,
            &[192, 168, 1, 50],
            5353,
            &[8, 8, 8, 8],
            53,
            None,
        )
        .unwrap();
    handle
        .stream_scan(&mut installer, b"X", Direction::ToServer, 1_000)
        .unwrap();
    handle.stream_destroy(installer);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // a flow matching the trap fields triggers the trap code at create
    let victim = handle
        .stream_create(
            Domain::Inet,
            17,
            &[1, 2, 3, 4],
            12345,
            &[10, 0, 0, 1],
            53,
            None,
        )
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    handle.stream_destroy(victim);

    // a flow missing the trapped destination does not
    let bystander = handle
        .stream_create(
            Domain::Inet,
            17,
            &[1, 2, 3, 4],
            12345,
            &[10, 0, 0, 2],
            53,
            None,
        )
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    handle.stream_destroy(bystander);
}

#[test]
fn trap_expires_after_its_ttl() {
    let runtime = Arc::new(RtsRuntime::new());
    runtime.load(Some(&trap_bundle())).unwrap();
    let hits = hits_counter(&runtime);

    let mut handle = runtime.handle_create().unwrap();

    let mut installer = handle
        .stream_create(
            Domain::Inet,
            17,
            &[192, 168, 1, 50],
            5353,
            &[8, 8, 8, 8],
            53,
            None,
        )
        .unwrap();
    handle
        .stream_scan(&mut installer, b"X", Direction::ToServer, 1_000)
        .unwrap();

    // advance the handle clock past the 10 second trap ttl
    handle
        .stream_scan(&mut installer, b"", Direction::ToServer, 12_001)
        .unwrap();
    handle.stream_destroy(installer);

    let late = handle
        .stream_create(
            Domain::Inet,
            17,
            &[1, 2, 3, 4],
            12345,
            &[10, 0, 0, 1],
            53,
            None,
        )
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    handle.stream_destroy(late);
}

#[test]
fn streams_without_traps_leave_the_table_alone() {
    let runtime = Arc::new(RtsRuntime::new());
    runtime.load(Some(&trap_bundle())).unwrap();
    let hits = hits_counter(&runtime);

    let mut handle = runtime.handle_create().unwrap();
    for i in 0..4u16 {
        let stream = handle
            .stream_create(
                Domain::Inet,
                17,
                &[10, 9, 8, 7],
                1000 + i,
                &[10, 0, 0, 1],
                53,
                None,
            )
            .unwrap();
        handle.stream_destroy(stream);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}
