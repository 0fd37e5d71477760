// Producer side of the shared-memory demo: sends SHA-256 digests as typed
// buffers over a link on a shared-memory band.
//
// cargo run --example shm_producer -- 1000 --auto-exit
use rtflow::Buffer::{FieldKind, FieldSpec, StreamBuffer};
use rtflow::Core::alloc::SegmentAllocator;
use rtflow::Core::unlink_shared_memory;
use rtflow::Transport::ShmChannel;
use rtflow::{logging, Link, State};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SEGMENT: &str = "rtflow_demo";
const SEGMENT_SIZE: usize = 4 * 1024 * 1024;

fn digest_spec() -> FieldSpec {
    FieldSpec::new("Digest", 1)
        .field("index", FieldKind::U64, &[])
        .field("digest", FieldKind::U8, &[32])
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("rtflow=info");
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_messages> [--auto-exit]", args[0]);
        std::process::exit(1);
    }
    let num_messages: u64 = args[1].parse()?;
    let auto_exit = args.get(2).map(|s| s == "--auto-exit").unwrap_or(false);

    let keep_alive = Arc::new(AtomicBool::new(true));
    let keep_alive_for_handler = keep_alive.clone();
    ctrlc::set_handler(move || {
        keep_alive_for_handler.store(false, Ordering::SeqCst);
    })?;

    let segment = Arc::new(SegmentAllocator::new(SEGMENT, SEGMENT_SIZE)?);
    let band = segment.create_band(256, 128)?;
    println!("Producer: segment {SEGMENT}, band {}", band.id());

    let mut link = Link::writer("digests", ShmChannel::sender(segment.clone(), band.id(), false)?);
    link.open()?;
    let mut unit = StreamBuffer::with_spec(&digest_spec())?;

    let start = Instant::now();
    let mut sent = 0u64;
    while sent < num_messages && keep_alive.load(Ordering::SeqCst) {
        let hash = Sha256::digest(format!("message_{sent}").as_bytes());
        unit.field_mut::<u64>("index")?[0] = sent;
        unit.field_mut::<u8>("digest")?.copy_from_slice(&hash);
        unit.set_sequence(sent + 1);

        // A WouldBlock keeps the encoded frame; retry until it is taken.
        while link.write(&unit)? == State::WouldBlock {
            std::thread::sleep(Duration::from_micros(10));
        }
        sent += 1;
        if sent % 100 == 0 {
            println!("Sent {sent} messages");
        }
    }

    let elapsed = start.elapsed();
    println!("Producer: Sent {sent} messages in {elapsed:.2?}");
    println!(
        "Producer: Throughput: {:.2} messages/sec",
        sent as f64 / elapsed.as_secs_f64()
    );

    if auto_exit {
        println!("Producer: Auto-exit mode, waiting 2 seconds for consumer...");
        std::thread::sleep(Duration::from_secs(2));
    } else {
        println!("Waiting for consumer to finish processing (press Ctrl+C to exit)...");
        while keep_alive.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    link.close();
    println!("Producer: Shutting down");
    unlink_shared_memory(SEGMENT)?;
    Ok(())
}
