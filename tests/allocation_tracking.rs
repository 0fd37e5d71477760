// Allocation tracking for the steady-state buffer paths.
//
// Note: tests using dhat are marked with #[serial_test::serial] because
// dhat only allows one profiler to run at a time.
//
// cargo test --test allocation_tracking -- --nocapture

use rtflow::Buffer::{FieldKind, FieldSpec, StreamBuffer};

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

fn spec() -> FieldSpec {
    FieldSpec::new("Subband", 2)
        .field("samples", FieldKind::ComplexF32, &[16, 64])
        .field("flags", FieldKind::U8, &[16])
        .field("station", FieldKind::U16, &[])
}

#[test]
#[serial_test::serial]
fn test_receive_path_does_not_allocate() {
    let _profiler = dhat::Profiler::builder().testing().build();

    let mut sent = StreamBuffer::with_spec(&spec()).unwrap();
    sent.extra_mut().extend_from_slice(b"beam 3");
    let mut received = StreamBuffer::with_spec(&spec()).unwrap();
    let mut wire = Vec::new();

    // Warm up: grows the wire buffer and the extra payload once.
    sent.serialize_into(&mut wire).unwrap();
    received.deserialize_into(&wire).unwrap();

    let before = dhat::HeapStats::get();
    for sequence in 0..100u64 {
        sent.set_sequence(sequence);
        sent.field_mut::<u16>("station").unwrap()[0] = sequence as u16;
        wire.clear();
        sent.serialize_into(&mut wire).unwrap();
        received.deserialize_into(&wire).unwrap();
        assert_eq!(received.sequence(), sequence);
    }
    let after = dhat::HeapStats::get();

    println!(
        "blocks before: {}, after: {}, bytes now: {}",
        before.total_blocks, after.total_blocks, after.curr_bytes
    );
    assert_eq!(after.total_blocks, before.total_blocks, "steady state allocated");
    println!("✓ Zero allocations across 100 serialize/deserialize cycles");
}
