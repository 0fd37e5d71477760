// Layout conformance tests for the shared-memory structures.
// Producer and consumer processes may be built separately, so sizes,
// alignments and field offsets are pinned here. The observed values are
// printed to aid debugging when a mismatch occurs on a given platform.
use memoffset::offset_of;
use rtflow::Transport::shm::layout::{BandEntry, SegmentHeader, SlotHeader, MAX_BANDS};
use rtflow::Transport::shm::ring::SlotRing;
use std::mem::{align_of, size_of};

#[test]
fn test_slot_header_layout() {
    let size = size_of::<SlotHeader>();
    let align = align_of::<SlotHeader>();
    let off_sequence = offset_of!(SlotHeader, sequence);
    let off_len = offset_of!(SlotHeader, len);
    let off_flags = offset_of!(SlotHeader, flags);

    println!(
        "SlotHeader => size: {size}, align: {align}, offsets: [sequence:{off_sequence}, len:{off_len}, flags:{off_flags}]"
    );

    assert_eq!(size, 16);
    assert_eq!(align, align_of::<u64>());
    assert_eq!(off_sequence, 0);
    assert_eq!(off_len, 8);
    assert_eq!(off_flags, 12);
}

#[test]
fn test_band_entry_layout() {
    let size = size_of::<BandEntry>();
    let align = align_of::<BandEntry>();
    let off_band_id = offset_of!(BandEntry, band_id);
    let off_flags = offset_of!(BandEntry, flags);
    let off_capacity = offset_of!(BandEntry, capacity);
    let off_slot_bytes = offset_of!(BandEntry, slot_bytes);
    let off_band_offset = offset_of!(BandEntry, band_offset);
    let off_data_signal = offset_of!(BandEntry, data_signal);
    let off_space_signal = offset_of!(BandEntry, space_signal);
    let off_tail = offset_of!(BandEntry, tail);
    let off_head = offset_of!(BandEntry, head);

    println!(
        "BandEntry => size: {size}, align: {align}, offsets: [band_id:{off_band_id}, flags:{off_flags}, capacity:{off_capacity}, slot_bytes:{off_slot_bytes}, band_offset:{off_band_offset}, data_signal:{off_data_signal}, space_signal:{off_space_signal}, tail:{off_tail}, head:{off_head}]"
    );

    assert_eq!(align, 128);
    assert_eq!(size % 128, 0);
    assert_eq!(off_band_id, 0);
    assert_eq!(off_flags, 4);
    assert_eq!(off_capacity, 8);
    assert_eq!(off_slot_bytes, 16);
    assert_eq!(off_band_offset, 24);
    assert_eq!(off_data_signal, 32);
    assert_eq!(off_space_signal, 36);

    // The cursors sit on their own cache lines.
    let line = align_of::<crossbeam_utils::CachePadded<u64>>();
    assert_eq!(off_tail % line, 0);
    assert_eq!(off_head % line, 0);
    assert!(off_head - off_tail >= line);
}

#[test]
fn test_segment_header_layout() {
    let size = size_of::<SegmentHeader>();
    let off_magic = offset_of!(SegmentHeader, magic);
    let off_version = offset_of!(SegmentHeader, version);
    let off_max_bands = offset_of!(SegmentHeader, max_bands);
    let off_band_count = offset_of!(SegmentHeader, band_count);
    let off_bands = offset_of!(SegmentHeader, bands);

    println!(
        "SegmentHeader => size: {size}, offsets: [magic:{off_magic}, version:{off_version}, max_bands:{off_max_bands}, band_count:{off_band_count}, bands:{off_bands}]"
    );

    assert_eq!(align_of::<SegmentHeader>(), 128);
    assert_eq!(off_magic, 0);
    assert_eq!(off_version, 8);
    assert_eq!(off_max_bands, 12);
    assert_eq!(off_band_count, 16);
    assert_eq!(off_bands, 128);
    assert_eq!(size, 128 + MAX_BANDS * size_of::<BandEntry>());
}

#[test]
fn test_slot_stride_is_cache_line_multiple() {
    for slot_bytes in [1, 48, 64, 100, 4096] {
        let stride = SlotRing::stride_for(slot_bytes);
        println!("slot_bytes {slot_bytes} => stride {stride}");
        assert_eq!(stride % 64, 0);
        assert!(stride >= size_of::<SlotHeader>() + slot_bytes);
    }
}
