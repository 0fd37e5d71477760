// Real-time ring and reader/writer synchronisation.
//
// cargo test --test realtime -- --nocapture

use proptest::prelude::*;
use rtflow::realtime::{
    RealtimeRing, StreamClock, SynchronizedReaderWriter, Synchronizer, WallClockReaderWriter,
};
use rtflow::{FlowError, MissingDataPolicy, RingConfig, SyncMode};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// Window ends fall due almost immediately at this rate.
const FAST: f64 = 1.0e9;
const DELAY: Duration = Duration::from_millis(20);

fn wall_clock(capacity: i64, policy: MissingDataPolicy) -> WallClockReaderWriter {
    WallClockReaderWriter::new(capacity, 0, StreamClock::starting_now(0, FAST), DELAY, policy)
}

proptest! {
    #[test]
    fn prop_pointer_distance_stays_in_bounds(
        capacity in 1i64..64,
        ops in prop::collection::vec((0u8..4, 0i64..80), 1..200),
    ) {
        let sync = SynchronizedReaderWriter::new(capacity, 0);
        let (mut last_read, mut last_write) = sync.pointers();
        for (op, amount) in ops {
            let (read, write) = sync.pointers();
            match op {
                0 => sync.finished_write(write + amount),
                1 => sync.finished_read(read + amount),
                2 if amount == 0 => sync.no_more_reading(),
                _ => {
                    let _ = sync.try_start_write(write, write + amount.max(1));
                }
            }
            let (read, write) = sync.pointers();
            prop_assert!(write - read >= 0, "read {} passed write {}", read, write);
            prop_assert!(write - read <= capacity, "write {} laps read {}", write, read);
            prop_assert!(read >= last_read && write >= last_write);
            last_read = read;
            last_write = write;
        }
    }
}

#[test]
fn test_requests_beyond_bounds_are_clamped_then_settle() {
    let sync = SynchronizedReaderWriter::new(10, 0);
    // Reader asks for more than was written.
    sync.finished_read(25);
    assert_eq!(sync.pointers(), (0, 0));
    // Writer asks for more than fits.
    sync.finished_write(40);
    let (read, write) = sync.pointers();
    println!("after clamp: read {read}, write {write}");
    assert_eq!(write - read, 10);
    // The read request is honoured as far as data allows.
    assert_eq!(sync.pointers(), (25, 35));
    // Once the reader is gone the writer runs free and pulls the read
    // pointer along behind it.
    sync.no_more_reading();
    assert_eq!(sync.pointers(), (30, 40));
    sync.finished_write(100);
    assert_eq!(sync.pointers(), (90, 100));
    assert_eq!(sync.overloads(), 0);
}

#[test]
fn test_try_start_write_counts_overloads() {
    let sync = SynchronizedReaderWriter::new(8, 0);
    assert!(sync.try_start_write(0, 8));
    sync.finished_write(8);
    assert!(!sync.try_start_write(8, 16));
    assert!(!sync.try_start_write(8, 12));
    assert_eq!(sync.overloads(), 2);

    sync.finished_read(4);
    assert!(sync.try_start_write(8, 12));
    assert_eq!(sync.overloads(), 2);
}

#[test]
fn test_bounded_writer_waits_for_reader() {
    let sync = Arc::new(SynchronizedReaderWriter::new(4, 0));
    sync.finished_write(4);

    let writer = {
        let sync = sync.clone();
        thread::spawn(move || {
            sync.start_write(4, 6);
            sync.finished_write(6);
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sync.write_pointer(), 4);
    assert!(!writer.is_finished());
    sync.finished_read(2);
    writer.join().unwrap();
    assert_eq!(sync.pointers(), (2, 6));
}

#[test]
fn test_start_read_timeout_and_no_more_writing() {
    let sync = SynchronizedReaderWriter::new(16, 0);
    assert!(!sync.start_read_timeout(0, 4, Duration::from_millis(10)));
    sync.no_more_writing();
    assert!(sync.is_writing_done());
    // The reader is released even though nothing was written.
    assert!(sync.start_read_timeout(0, 4, Duration::from_millis(10)));
}

#[test]
fn test_wall_clock_complete_window() {
    let sync = wall_clock(1000, MissingDataPolicy::Fatal);
    assert!(sync.start_write(0, 100));
    sync.finished_write(100);
    let window = sync.start_read(0, 100).unwrap();
    assert!(window.is_complete());
    assert_eq!(sync.missing_windows(), 0);
}

#[test]
fn test_wall_clock_tolerates_missing_data() {
    let sync = wall_clock(1000, MissingDataPolicy::Tolerate);
    assert!(sync.start_write(0, 50));
    sync.finished_write(50);

    let started = Instant::now();
    let window = sync.start_read(0, 100).unwrap();
    println!("read gave up after {:?}: {window:?}", started.elapsed());
    assert_eq!(window.missing, Some(50..100));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(sync.missing_windows(), 1);
    sync.finished_read(100);

    // The late half is dropped rather than written into a consumed window.
    assert!(!sync.start_write(50, 100));
    assert_eq!(sync.overloads(), 1);
    assert!(sync.start_write(100, 200));
}

#[test]
fn test_wall_clock_fatal_policy_reports_missing_range() {
    let sync = wall_clock(1000, MissingDataPolicy::Fatal);
    assert!(sync.start_write(0, 30));
    sync.finished_write(30);
    match sync.start_read(0, 100) {
        Err(FlowError::MissingData { begin, end }) => assert_eq!((begin, end), (30, 100)),
        other => panic!("expected missing data, got {other:?}"),
    }
    assert!(sync.start_read(0, 100).is_ok());
}

#[test]
fn test_wall_clock_writer_never_waits() {
    let sync = wall_clock(100, MissingDataPolicy::Tolerate);
    assert!(sync.start_write(0, 100));
    sync.finished_write(100);
    let started = Instant::now();
    assert!(!sync.start_write(100, 150));
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(sync.overloads(), 1);
}

#[test]
fn test_ring_streams_blocks_across_threads() {
    let ring = Arc::new(
        RealtimeRing::new(
            vec![0u64; 4],
            10,
            Synchronizer::Bounded(SynchronizedReaderWriter::new(40, 0)),
        )
        .unwrap(),
    );
    let blocks = 200i64;

    let writer = {
        let ring = ring.clone();
        thread::spawn(move || {
            for block in 0..blocks {
                ring.write(block * 10, |unit| *unit = block as u64 * 7).unwrap();
                let (read, write) = ring.synchronizer().pointers();
                assert!((0..=40).contains(&(write - read)));
            }
            ring.no_more_writing();
        })
    };

    for block in 0..blocks {
        let value = ring.read(block * 10, |unit| *unit).unwrap();
        assert_eq!(value, Some(block as u64 * 7), "block {block}");
    }
    writer.join().unwrap();
    assert_eq!(ring.overloads(), 0);

    // Past the end of the stream nothing is there.
    assert_eq!(ring.read(blocks * 10, |unit| *unit).unwrap(), None);
}

#[test]
fn test_ring_try_write_refuses_when_full() {
    let ring = RealtimeRing::new(
        vec![0u32; 2],
        10,
        Synchronizer::Bounded(SynchronizedReaderWriter::new(20, 0)),
    )
    .unwrap();
    ring.try_write(0, |u| *u = 1).unwrap();
    ring.try_write(10, |u| *u = 2).unwrap();
    let err = ring.try_write(20, |u| *u = 3).unwrap_err();
    assert!(err.is_overload());
    assert_eq!(ring.overloads(), 1);

    assert_eq!(ring.read(0, |u| *u).unwrap(), Some(1));
    ring.try_write(20, |u| *u = 3).unwrap();
    assert_eq!(ring.read(10, |u| *u).unwrap(), Some(2));
    assert_eq!(ring.read(20, |u| *u).unwrap(), Some(3));
}

#[test]
fn test_ring_rejects_bad_geometry_and_unaligned_times() {
    let mismatch = RealtimeRing::new(
        vec![0u8; 3],
        10,
        Synchronizer::Bounded(SynchronizedReaderWriter::new(40, 0)),
    );
    assert!(matches!(mismatch, Err(FlowError::Config(_))));

    let ring = RealtimeRing::new(
        vec![0u8; 4],
        10,
        Synchronizer::Bounded(SynchronizedReaderWriter::new(40, 0)),
    )
    .unwrap();
    assert!(matches!(ring.write(5, |_| {}), Err(FlowError::Layout(_))));
}

#[test]
fn test_wall_clock_ring_skips_missing_block() {
    let ring = RealtimeRing::new(
        vec![Vec::<u8>::new(); 4],
        16,
        Synchronizer::WallClock(wall_clock(64, MissingDataPolicy::Tolerate)),
    )
    .unwrap();
    ring.write(0, |unit| unit.extend_from_slice(b"first")).unwrap();

    assert_eq!(ring.read(0, |unit| unit.clone()).unwrap(), Some(b"first".to_vec()));
    // Block 16 never arrives before its deadline.
    assert_eq!(ring.read(16, |unit| unit.clone()).unwrap(), None);
    // Arriving afterwards, it is dropped.
    let late = ring.write(16, |unit| unit.push(1)).unwrap_err();
    assert!(late.is_overload());
    ring.write(32, |unit| unit.push(2)).unwrap();
}

#[test]
fn test_ring_from_config() {
    let config = RingConfig {
        mode: SyncMode::Bounded,
        capacity: 64,
        block_len: 16,
        ..RingConfig::default()
    };
    let ring = RealtimeRing::from_config(&config, 1024, || 0i32).unwrap();
    assert_eq!(ring.slot_count(), 4);
    assert_eq!(ring.block_len(), 16);
    assert_eq!(ring.synchronizer().pointers(), (1024, 1024));
    ring.write(1024, |u| *u = 5).unwrap();
    assert_eq!(ring.read(1024, |u| *u).unwrap(), Some(5));

    let bad = RingConfig {
        capacity: 60,
        block_len: 16,
        ..RingConfig::default()
    };
    assert!(RealtimeRing::from_config(&bad, 0, || 0i32).is_err());
}
