// Corner-turn demo: every rank holds one subband per rank and sends each
// subband to its owner, so after the exchange each rank holds one subband
// from every station.
//
// cargo run --example transpose -- 4 5
use rtflow::Buffer::{FieldKind, FieldSpec, StreamBuffer};
use rtflow::redistribution::ClusterInterconnect;
use rtflow::Transport::Fabric;
use rtflow::{logging, FlowResult, RedistributionEngine, RedistributionGroup};
use std::env;
use std::thread;
use std::time::Instant;

const SAMPLES: usize = 4096;

fn subband_spec() -> FieldSpec {
    FieldSpec::new("Subband", 1)
        .field("station", FieldKind::U32, &[])
        .field("samples", FieldKind::ComplexF32, &[SAMPLES])
}

fn run_rank(rank: usize, ranks: usize, rounds: u64, fabric: &std::sync::Arc<Fabric>) -> FlowResult<u64> {
    let group = RedistributionGroup::all_to_all(rank, ranks)?;
    let interconnect = ClusterInterconnect::new(fabric.endpoint(rank)?);
    let mut engine: RedistributionEngine<_, StreamBuffer> = RedistributionEngine::new(group, interconnect);

    let spec = subband_spec();
    let mut outgoing = (0..ranks - 1)
        .map(|_| StreamBuffer::with_spec(&spec))
        .collect::<FlowResult<Vec<_>>>()?;
    let mut incoming = (0..ranks - 1)
        .map(|_| StreamBuffer::with_spec(&spec))
        .collect::<FlowResult<Vec<_>>>()?;

    let mut received = 0;
    for round in 1..=rounds {
        engine.post_receives()?;
        let destinations = engine.group().destinations().to_vec();
        for dest in destinations {
            let Some(mut unit) = outgoing.pop() else {
                break;
            };
            unit.field_mut::<u32>("station")?[0] = rank as u32;
            unit.set_sequence(round);
            engine.async_send(dest, unit)?;
        }
        while let Some(index) = engine.wait_for_any(&mut incoming)? {
            let station = incoming[index].field::<u32>("station")?[0];
            tracing::debug!(rank, round, station, "subband arrived");
            received += 1;
        }
        outgoing.extend(engine.wait_for_all_sends()?.into_iter().map(|(_, unit)| unit));
    }
    Ok(received)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("rtflow=info");
    let args: Vec<String> = env::args().collect();
    let ranks: usize = args.get(1).map(|s| s.parse()).transpose()?.unwrap_or(4);
    let rounds: u64 = args.get(2).map(|s| s.parse()).transpose()?.unwrap_or(5);
    if ranks < 2 {
        eprintln!("Usage: {} [ranks >= 2] [rounds]", args[0]);
        std::process::exit(1);
    }

    let fabric = Fabric::new(ranks);
    let start = Instant::now();
    let handles: Vec<_> = (0..ranks)
        .map(|rank| {
            let fabric = fabric.clone();
            thread::spawn(move || run_rank(rank, ranks, rounds, &fabric))
        })
        .collect();

    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(received)) => println!("rank {rank}: received {received} subbands"),
            Ok(Err(e)) => println!("rank {rank}: failed: {e}"),
            Err(_) => println!("rank {rank}: panicked"),
        }
    }
    let bytes = (ranks * (ranks - 1)) as u64 * rounds * (SAMPLES * 8) as u64;
    println!(
        "Transposed {:.1} MiB in {:.2?}",
        bytes as f64 / (1024.0 * 1024.0),
        start.elapsed()
    );
    Ok(())
}
