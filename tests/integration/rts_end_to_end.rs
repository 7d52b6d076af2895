//! Signature load, subscription, and scan classification end to end.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use flowmon::rts::value::{pack_id, ValueType, FLAG_EXPORT};
use flowmon::rts::{Direction, Domain, RtsRuntime, SubValue};
use flowmon::FlowError;

use common::{asm::Asm, dead_state, t4f_state_id, BundleBuilder};

/// Bundle: TCP streams (protocol 6) whose first client byte is 'G' run a
/// function that stores "example.com" into the exported `site.host`.
fn site_host_bundle() -> Vec<u8> {
    let site_host_id = pack_id(1, ValueType::String, FLAG_EXPORT);

    // pc 0 is the stream-setup entry; real code starts after its HALT.
    let program = Asm::new().halt();
    let fun_pc = program.pc();
    let program = program.pstr("example.com").store(site_host_id).popb().halt();

    let mut states = vec![dead_state(); 8];
    // protocol 6 entry state accepts 'G' and edges into t4f slot 1
    states[6] = (t4f_state_id(1), b'G' as u16, b'G' as u16 + 1);

    BundleBuilder::new()
        .vars(2)
        .keys(&[("site.host", 1, 2)])
        .code(program.code)
        .ran_states(&states)
        .t4f(&[(0, 0), (0, 1)])
        .ftab(&[&[], &[fun_pc]])
        .build()
}

#[test]
fn subscribe_scan_publishes_exported_value() {
    let runtime = Arc::new(RtsRuntime::new());
    runtime.load(Some(&site_host_bundle())).unwrap();

    let seen: Arc<Mutex<Vec<(String, SubValue)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    runtime
        .subscribe(
            "site.host",
            Arc::new(move |event| {
                sink.lock()
                    .unwrap()
                    .push((event.key.clone(), event.value.clone()));
            }),
        )
        .unwrap();

    let mut handle = runtime.handle_create().unwrap();
    let mut stream = handle
        .stream_create(
            Domain::Inet,
            6,
            &[10, 0, 0, 2],
            43210,
            &[93, 184, 216, 34],
            443,
            None,
        )
        .unwrap();

    assert!(handle.stream_matching(&stream));
    let consumed = handle
        .stream_scan(&mut stream, b"GET / HTTP/1.1\r\n", Direction::ToServer, 1000)
        .unwrap();
    assert!(consumed >= 1);

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "site.host");
    match &events[0].1 {
        SubValue::String(v) => {
            assert_eq!(v.len(), 11);
            assert_eq!(v.as_slice(), b"example.com");
        }
        other => panic!("expected string value, got {other:?}"),
    }
    drop(events);

    // classification complete: the stream stopped matching
    assert!(!handle.stream_matching(&stream));
    assert_eq!(
        handle
            .stream_scan(&mut stream, b"more", Direction::ToServer, 2000)
            .unwrap(),
        0
    );
    handle.stream_destroy(stream);
}

#[test]
fn unload_blocks_stream_creation_until_next_load() {
    let runtime = Arc::new(RtsRuntime::new());
    runtime.load(Some(&site_host_bundle())).unwrap();
    let mut handle = runtime.handle_create().unwrap();

    let stream = handle
        .stream_create(Domain::Inet, 6, &[1, 1, 1, 1], 1, &[2, 2, 2, 2], 2, None)
        .unwrap();
    handle.stream_destroy(stream);

    runtime.load(None).unwrap();
    let err = handle
        .stream_create(Domain::Inet, 6, &[1, 1, 1, 1], 1, &[2, 2, 2, 2], 2, None)
        .unwrap_err();
    assert!(matches!(err, FlowError::NoSignature));

    runtime.load(Some(&site_host_bundle())).unwrap();
    let stream = handle
        .stream_create(Domain::Inet, 6, &[1, 1, 1, 1], 1, &[2, 2, 2, 2], 2, None)
        .unwrap();
    handle.stream_destroy(stream);
}

#[test]
fn mid_stream_reload_terminates_the_stream() {
    let runtime = Arc::new(RtsRuntime::new());
    runtime.load(Some(&site_host_bundle())).unwrap();
    let mut handle = runtime.handle_create().unwrap();

    let mut stream = handle
        .stream_create(Domain::Inet, 6, &[1, 1, 1, 1], 1, &[2, 2, 2, 2], 2, None)
        .unwrap();

    // hot reload while the stream is live
    runtime.load(Some(&site_host_bundle())).unwrap();

    // the stale-generation stream goes terminal instead of scanning
    assert_eq!(
        handle
            .stream_scan(&mut stream, b"GET", Direction::ToServer, 1000)
            .unwrap(),
        0
    );
    assert!(!handle.stream_matching(&stream));
    handle.stream_destroy(stream);
}

#[test]
fn rusage_tracks_scans_and_pool() {
    let runtime = Arc::new(RtsRuntime::new());
    runtime.load(Some(&site_host_bundle())).unwrap();
    let mut handle = runtime.handle_create().unwrap();

    let mut stream = handle
        .stream_create(
            Domain::Inet,
            6,
            &[10, 0, 0, 2],
            1000,
            &[10, 0, 0, 3],
            80,
            None,
        )
        .unwrap();
    handle
        .stream_scan(&mut stream, b"GET", Direction::ToServer, 1)
        .unwrap();
    handle.stream_destroy(stream);

    let usage = handle.rusage();
    assert_eq!(usage.scan_started, 1);
    assert_eq!(usage.scan_stopped, 1);
    assert!(usage.scan_bytes >= 1);
    assert!(usage.peak_alloc > 0);
    assert!(usage.curr_alloc <= usage.peak_alloc);

    // counters reset on read
    let usage = handle.rusage();
    assert_eq!(usage.scan_started, 0);
}

#[test]
fn unknown_key_and_no_signature_subscription_errors() {
    let runtime = Arc::new(RtsRuntime::new());
    let cb: flowmon::rts::SubCallback = Arc::new(|_| {});
    assert!(matches!(
        runtime.subscribe("site.host", cb.clone()),
        Err(FlowError::NoSignature)
    ));

    runtime.load(Some(&site_host_bundle())).unwrap();
    assert!(matches!(
        runtime.subscribe("no.such.key", cb),
        Err(FlowError::UnknownKey(_))
    ));
}

#[test]
fn lookup_reports_service_count() {
    let runtime = Arc::new(RtsRuntime::new());
    runtime.load(Some(&site_host_bundle())).unwrap();
    match runtime.lookup(-1, None).unwrap() {
        flowmon::rts::LookupAnswer::Count(n) => assert_eq!(n, 0),
        other => panic!("expected count, got {other:?}"),
    }
    assert!(runtime.lookup(3, None).is_err());
}

#[test]
fn callbacks_fire_once_per_matching_stream() {
    let runtime = Arc::new(RtsRuntime::new());
    runtime.load(Some(&site_host_bundle())).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let sink = hits.clone();
    runtime
        .subscribe(
            "site.host",
            Arc::new(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let mut handle = runtime.handle_create().unwrap();
    for i in 0..3u16 {
        let mut stream = handle
            .stream_create(
                Domain::Inet,
                6,
                &[10, 0, 0, 2],
                40000 + i,
                &[10, 0, 0, 9],
                80,
                None,
            )
            .unwrap();
        handle
            .stream_scan(&mut stream, b"GET /", Direction::ToServer, 100)
            .unwrap();
        handle.stream_destroy(stream);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}
