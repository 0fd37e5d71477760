use std::fmt;
use crate::Core::alloc::BandPartition;
use crate::Core::alloc::SegmentAllocator;
use crate::Transport::shm::ring::SlotRing;

/// Debug function for SegmentAllocator
///
/// Provides a safe debug representation that shows:
/// - Segment name
/// - Header pointer location
/// - Next band ID and active band count
/// - Initialization status
pub fn debug_segment_allocator(allocator: &SegmentAllocator, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SegmentAllocator")
        .field("segment", &allocator.segment_name())
        .field("header", &format_args!("{:p}", allocator.header_ptr()))
        .field("next_band_id", &allocator.next_band_id())
        .field("band_count", &allocator.band_count())
        .field("initialized", &allocator.is_initialized())
        .finish()
}

/// Debug function for BandPartition
///
/// Shows:
/// - Band ID
/// - Underlying SlotRing details
pub fn debug_band_partition(partition: &BandPartition, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BandPartition")
        .field("band_id", &partition.band_id)
        .field("capacity", &partition.capacity)
        .field("ring", &partition.ring)
        .finish()
}

/// Debug function for SlotRing
///
/// Displays the ring's memory location and geometry plus the live cursor
/// distance, without touching slot contents
pub fn debug_slot_ring(ring: &SlotRing, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SlotRing")
        .field("base", &format_args!("0x{:x}", ring.buffer_base as usize))
        .field("capacity", &ring.capacity)
        .field("slot_bytes", &ring.slot_bytes)
        .field("stride", &ring.stride)
        .field("pending", &ring.len())
        .field("closed", &ring.is_closed())
        .finish()
}
