use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use crate::coordinator;
use crate::generator;
use crate::seg::{SegConfig, SegmentService};

static TEST_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn test_config(dir: &TempDir) -> SegConfig {
    let test_id = TEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    SegConfig::builder()
        .data_dir(dir.path().to_str().expect("tempdir path is not UTF-8"))
        .link_name(format!("pipeline-test-{}-{}", std::process::id(), test_id))
        .build()
}

fn parse_ids(output: &[u8]) -> Vec<(u32, u32)> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 5, "malformed line {:?}", line);
            let id: u32 = fields[0].parse().expect("id field");
            let source: u32 = fields[4]
                .strip_prefix("Gen")
                .expect("source field")
                .parse()
                .expect("source index");
            (id, source)
        })
        .collect()
}

#[test]
fn pipeline_covers_every_identifier_exactly_once() {
    let dir = tempdir().expect("tempdir");
    let cfg = test_config(&dir);
    let total = 25u32;
    let generators = 2u32;
    let seg = SegmentService::create(&cfg, total, generators).expect("create segment");

    let mut workers = Vec::new();
    for child_index in 1..=generators {
        let worker_cfg = cfg.clone();
        workers.push(thread::spawn(move || {
            let seg = SegmentService::open(&worker_cfg).expect("open segment");
            generator::run(&seg, child_index).expect("generator run");
        }));
    }

    let closing = AtomicBool::new(false);
    let mut sink = Vec::new();
    let written = coordinator::run(&seg, &mut sink, &closing).expect("coordinator run");
    coordinator::request_shutdown(&seg, generators).expect("shutdown");
    for worker in workers {
        worker.join().expect("worker join");
    }

    assert_eq!(written, total);
    let records = parse_ids(&sink);
    assert_eq!(records.len(), total as usize);
    let ids: BTreeSet<u32> = records.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, (1..=total).collect::<BTreeSet<u32>>());
    for (_, source) in &records {
        assert!((1..=generators).contains(source));
    }
}

#[test]
fn terminate_unblocks_a_generator_waiting_on_the_slot() {
    let dir = tempdir().expect("tempdir");
    let cfg = test_config(&dir);
    // Far more ids than the consumer will drain, so the generator ends up
    // blocked on the empty-slot wait.
    let seg = SegmentService::create(&cfg, 10_000, 1).expect("create segment");

    let worker_cfg = cfg.clone();
    let worker = thread::spawn(move || {
        let seg = SegmentService::open(&worker_cfg).expect("open segment");
        generator::run(&seg, 1).expect("generator run");
    });

    // Drain two records, then stop consuming.
    for _ in 0..2 {
        while !seg.wait_full(Duration::from_millis(100)).expect("wait full") {}
        seg.with_state(|s| s.total_written += 1).expect("consume");
        seg.signal_empty().expect("signal empty");
    }

    coordinator::request_shutdown(&seg, 1).expect("shutdown");
    worker.join().expect("worker join");
    let active = seg.with_state(|s| s.active_generators).expect("state");
    assert_eq!(active, 0);
}

#[test]
fn coordinator_returns_only_when_all_conditions_hold() {
    let dir = tempdir().expect("tempdir");
    let cfg = test_config(&dir);
    let seg = SegmentService::create(&cfg, 1, 1).expect("create segment");
    // Id space already exhausted, but one generator is still live.
    seg.with_state(|s| s.next_id = 2).expect("state");

    let (tx, rx) = mpsc::channel();
    let closing = Arc::new(AtomicBool::new(false));
    let coord_cfg = cfg.clone();
    let coord_closing = Arc::clone(&closing);
    thread::spawn(move || {
        let seg = SegmentService::open(&coord_cfg).expect("open segment");
        let mut sink = Vec::new();
        let written = coordinator::run(&seg, &mut sink, &coord_closing).expect("coordinator");
        tx.send((written, sink)).expect("send result");
    });

    thread::sleep(Duration::from_millis(100));
    assert!(rx.try_recv().is_err(), "returned with a generator still active");

    // Publish the single record; the generator count still pins the loop.
    while !seg.wait_empty(Duration::from_millis(100)).expect("wait empty") {}
    seg.with_state(|s| s.store_record(1, b"1,Ana,30,Salta,Gen1"))
        .expect("publish");
    seg.signal_full().expect("signal full");
    thread::sleep(Duration::from_millis(100));
    assert!(rx.try_recv().is_err(), "returned with a generator still active");

    seg.with_state(|s| s.active_generators = 0).expect("retire");
    let (written, sink) = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("coordinator should return once all conditions hold");
    assert_eq!(written, 1);
    assert_eq!(String::from_utf8_lossy(&sink), "1,Ana,30,Salta,Gen1\n");
}

#[test]
fn batches_are_capped_and_exclusive() {
    let dir = tempdir().expect("tempdir");
    let cfg = test_config(&dir);
    let seg = SegmentService::create(&cfg, 23, 1).expect("create segment");

    let first = generator::claim_batch(&seg).expect("claim").expect("batch");
    assert_eq!((first.start, first.block), (1, 10));
    let second = generator::claim_batch(&seg).expect("claim").expect("batch");
    assert_eq!((second.start, second.block), (11, 10));
    let third = generator::claim_batch(&seg).expect("claim").expect("batch");
    assert_eq!((third.start, third.block), (21, 3));
    assert!(generator::claim_batch(&seg).expect("claim").is_none());

    seg.with_state(|s| s.terminate = 1).expect("state");
    assert!(generator::claim_batch(&seg).expect("claim").is_none());
}
