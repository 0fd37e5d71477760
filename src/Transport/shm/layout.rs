use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// The maximum number of bands that can be configured in one segment.
/// This must be a constant to allow for a fixed-size array in the SegmentHeader.
pub const MAX_BANDS: usize = 64;

/// "RTFLOWSH"
pub const SEGMENT_MAGIC: u64 = 0x5254_464C_4F57_5348;

/// Version of the in-segment layout. Bump on any change to the structs below.
pub const SEGMENT_VERSION: u32 = 1;

/// Band flag: one side closed the band; the other side sees `Error` once drained.
pub const BAND_CLOSED: u32 = 1 << 0;

/// Band flag: the band was removed from the segment and must not be reopened.
pub const BAND_RETIRED: u32 = 1 << 1;

/// Slot flag: more fragments of the same frame follow in the next slot.
pub const FRAG_MORE: u32 = 1 << 0;

/// Defines the metadata for a single band (one directional slot ring) within
/// the segment header.
///
/// This struct contains the atomic cursors and layout information necessary
/// to manage one band. The control plane stays separate from the data plane.
#[repr(C, align(128))]
pub struct BandEntry {
    /// Logical identifier.
    pub band_id: u32,

    /// Per-band flags (`BAND_CLOSED`, `BAND_RETIRED`).
    pub flags: AtomicU32,

    /// Number of slots in this band's ring. Power of two; 0 means unused.
    pub capacity: u64,

    /// Usable payload bytes per slot.
    pub slot_bytes: u64,

    /// Byte offset from the start of the segment to the band's first slot.
    pub band_offset: u64,

    /// Bumped by producers after publishing; consumers futex-wait on it.
    pub data_signal: AtomicU32,

    /// Bumped by consumers after freeing a slot; blocked producers wait on it.
    pub space_signal: AtomicU32,

    /// Producer cursor. Padded to prevent false sharing with `head`.
    pub tail: CachePadded<AtomicU64>,

    /// Consumer cursor.
    pub head: CachePadded<AtomicU64>,
}

/// The header located at the very beginning of a segment.
#[repr(C, align(128))]
pub struct SegmentHeader {
    /// A "magic number" to identify the memory region as an rtflow segment.
    pub magic: u64,

    /// The version of the memory layout.
    pub version: u32,

    /// Compiled maximum band entries.
    pub max_bands: u32,

    /// The number of bands currently configured.
    pub band_count: u32,

    pub reserved: u32,

    /// The table of metadata for each band.
    pub bands: [BandEntry; MAX_BANDS],
}

/// Per-slot header preceding `slot_bytes` of payload.
#[repr(C)]
pub struct SlotHeader {
    /// Synchronisation word.
    /// - A producer claims a `tail` sequence and waits for `sequence == tail`.
    /// - After writing, it sets `sequence = tail + 1`.
    /// - A consumer waits for `sequence == head + 1`, reads, then frees the
    ///   slot with `sequence = head + capacity`.
    pub sequence: AtomicU64,

    /// Bytes of payload used in this slot.
    pub len: u32,

    /// `FRAG_MORE` when the frame continues in the next slot.
    pub flags: u32,
}
