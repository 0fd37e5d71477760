// Consumer side of the shared-memory demo: attaches to the producer's
// segment, reads digest buffers and checks each one.
//
// cargo run --example shm_consumer -- 1000
use rtflow::Buffer::{FieldKind, FieldSpec, StreamBuffer};
use rtflow::Core::alloc::SegmentAllocator;
use rtflow::Transport::ShmChannel;
use rtflow::{logging, FlowError, Link, State};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SEGMENT: &str = "rtflow_demo";
const SEGMENT_SIZE: usize = 4 * 1024 * 1024;
const BAND: u32 = 0;

fn digest_spec() -> FieldSpec {
    FieldSpec::new("Digest", 1)
        .field("index", FieldKind::U64, &[])
        .field("digest", FieldKind::U8, &[32])
}

fn attach() -> std::io::Result<Arc<SegmentAllocator>> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match SegmentAllocator::attach(SEGMENT, SEGMENT_SIZE) {
            Ok(segment) if segment.get_band(BAND).is_some() => return Ok(Arc::new(segment)),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && Instant::now() < deadline => {}
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "producer never created its band"));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("rtflow=info");
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <expected_messages>", args[0]);
        std::process::exit(1);
    }
    let expected: u64 = args[1].parse()?;

    println!("Consumer: Waiting for segment {SEGMENT}...");
    let segment = attach()?;
    let mut link = Link::reader("digests", ShmChannel::receiver(segment, BAND, true)?);
    link.open()?;
    let mut unit = StreamBuffer::with_spec(&digest_spec())?;

    let start = Instant::now();
    let mut received = 0u64;
    let mut corrupt = 0u64;
    println!("\n{:<10} Hash", "Msg #");
    println!("{}", "=".repeat(80));

    while received < expected {
        match link.read(&mut unit) {
            Ok(State::Finished) => {
                let index = unit.field::<u64>("index")?[0];
                let digest = unit.field::<u8>("digest")?;
                let hash = Sha256::digest(format!("message_{index}").as_bytes());
                if digest != hash.as_slice() {
                    corrupt += 1;
                }
                let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                println!("{index:<10} {hex}");
                received += 1;
            }
            Ok(_) => std::thread::sleep(Duration::from_micros(10)),
            Err(FlowError::Transport { kind, .. }) => {
                println!("Consumer: producer went away ({kind:?})");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let elapsed = start.elapsed();
    let stats = link.stats();
    println!("{}", "=".repeat(80));
    println!("Consumer: Received {received} messages in {elapsed:.2?}, {corrupt} corrupt");
    println!("Consumer: lost {}, duplicated {}", stats.lost, stats.duplicated);
    link.close();
    Ok(())
}
