use crate::Core::SharedMemory::{align_up, SharedMemoryBackend};
use crate::Transport::shm::layout::{
    SegmentHeader, BAND_CLOSED, BAND_RETIRED, MAX_BANDS, SEGMENT_MAGIC, SEGMENT_VERSION,
};
use crate::Transport::shm::ring::SlotRing;
use std::io;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering};
mod debug;
mod getters;

// Use parking_lot's Mutex for better performance
use parking_lot::Mutex;

/// One band's memory region inside a segment.
pub struct BandPartition {
    /// The slot ring laid over this band
    pub ring: SlotRing,
    /// The band's identifier inside the segment
    pub band_id: u32,
    /// Number of slots
    pub capacity: usize,
}

/// Allocator carving one named shared-memory segment into bands.
///
/// Several logical channels share the segment explicitly by holding an
/// `Arc<SegmentAllocator>` and addressing their own band.
pub struct SegmentAllocator {
    shm: Box<dyn SharedMemoryBackend>,
    header: *mut SegmentHeader,
    next_band_id: AtomicU64,
    allocation_mutex: Mutex<()>, // For thread-safe band creation
}

impl SegmentAllocator {
    /// Bytes taken by the segment header.
    pub fn header_size() -> usize {
        align_up(std::mem::size_of::<SegmentHeader>())
    }

    /// Create a new segment `name` of `size` bytes and initialise its header.
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        let aligned_size = align_up(size);
        let control_size = Self::header_size();

        // Ensure there's enough space for the header
        if aligned_size < control_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "SegmentAllocator::new(): size too small to fit header. Requested: {}, Needed: {}",
                    aligned_size, control_size
                ),
            ));
        }

        let shm = crate::Core::SharedMemory::create_shared_memory(aligned_size, name).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "Failed to create shared memory:\n\
                    ├─ Segment:      {name}\n\
                    ├─ Aligned size: {aligned_size}\n\
                    ├─ Header size:  {control_size}\n\
                    ╰─ Error: {e}"
                ),
            )
        })?;

        let header_ptr = shm.as_ptr() as *mut SegmentHeader;
        if (header_ptr as usize) % 128 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Shared memory not properly aligned",
            ));
        }

        // The mapping is zero-filled, so every band entry already reads as
        // unused; only the identification fields need writing.
        unsafe {
            addr_of_mut!((*header_ptr).magic).write(SEGMENT_MAGIC);
            addr_of_mut!((*header_ptr).version).write(SEGMENT_VERSION);
            addr_of_mut!((*header_ptr).max_bands).write(MAX_BANDS as u32);
            addr_of_mut!((*header_ptr).band_count).write(0);
        }

        tracing::debug!(segment = name, size = aligned_size, "created shared segment");

        Ok(Self {
            shm,
            header: header_ptr,
            next_band_id: AtomicU64::new(0),
            allocation_mutex: Mutex::new(()),
        })
    }

    /// Attach to an existing segment created by [`new`](Self::new).
    pub fn attach(name: &str, size: usize) -> io::Result<Self> {
        let aligned_size = align_up(size).max(Self::header_size());

        let shm = crate::Core::SharedMemory::attach_shared_memory(name, aligned_size)?;

        let header = shm.as_ptr() as *mut SegmentHeader;
        if (header as usize) % 128 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Shared memory not properly aligned",
            ));
        }

        // Verify magic number and version
        unsafe {
            if (*header).magic != SEGMENT_MAGIC {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Invalid magic number - shared memory not properly initialized",
                ));
            }
            if (*header).version != SEGMENT_VERSION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Segment layout version {} does not match ours ({})",
                        (*header).version,
                        SEGMENT_VERSION
                    ),
                ));
            }
        }

        // Find the next available band ID
        let next_id = unsafe {
            let header = &*header;
            (0..MAX_BANDS)
                .filter(|&i| header.bands[i].capacity > 0)
                .max()
                .map(|max| max + 1)
                .unwrap_or(0) as u64
        };

        tracing::debug!(segment = name, "attached to shared segment");

        Ok(Self {
            shm,
            header,
            next_band_id: AtomicU64::new(next_id),
            allocation_mutex: Mutex::new(()),
        })
    }

    /// Create a new band of `capacity` slots, each carrying `slot_bytes`.
    pub fn create_band(&self, capacity: usize, slot_bytes: usize) -> io::Result<BandPartition> {
        // Validate capacity is a power of two and non-zero
        if capacity == 0 || (capacity & (capacity - 1)) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Capacity must be a power of two and greater than zero",
            ));
        }
        if slot_bytes == 0 || slot_bytes > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Slot size must be between 1 and u32::MAX bytes",
            ));
        }

        // Use a mutex to prevent multiple threads from allocating overlapping memory
        let _guard = self.allocation_mutex.lock();

        let band_id = self.next_band_id.load(Ordering::Acquire);
        if band_id >= MAX_BANDS as u64 {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "Maximum number of bands reached",
            ));
        }
        let band_id = band_id as u32;

        let band_size = align_up(SlotRing::band_size(capacity, slot_bytes));
        let offset = align_up(self.used_memory());

        // Check if we have enough space
        if offset + band_size > self.shm.size() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!(
                    "Not enough space in shared memory: band needs {} bytes, {} available",
                    band_size,
                    self.shm.size().saturating_sub(offset)
                ),
            ));
        }

        let band = unsafe { &mut (*self.header).bands[band_id as usize] };
        band.band_id = band_id;
        band.flags.store(0, Ordering::Relaxed);
        band.band_offset = offset as u64;
        band.slot_bytes = slot_bytes as u64;
        band.data_signal.store(0, Ordering::Relaxed);
        band.space_signal.store(0, Ordering::Relaxed);
        band.tail.store(0, Ordering::Relaxed);
        band.head.store(0, Ordering::Relaxed);

        // Initialize ring view and slots before the band becomes visible
        band.capacity = capacity as u64;
        let buffer_ptr = unsafe { self.shm.as_ptr().add(offset) };
        let ring = unsafe { SlotRing::new(band, buffer_ptr) };
        unsafe {
            ring.init_slots();
            (*self.header).band_count += 1;
        }
        self.next_band_id.store(band_id as u64 + 1, Ordering::Release);

        tracing::debug!(band_id, capacity, slot_bytes, offset, "created band");

        Ok(BandPartition {
            ring,
            band_id,
            capacity,
        })
    }

    /// Get a band by ID
    pub fn get_band(&self, band_id: u32) -> Option<BandPartition> {
        if band_id >= MAX_BANDS as u32 {
            return None;
        }

        let band = unsafe { &(*self.header).bands[band_id as usize] };
        if band.capacity == 0 || band.flags.load(Ordering::Acquire) & BAND_RETIRED != 0 {
            return None; // Band not initialized or retired
        }

        let buffer_ptr = unsafe { self.shm.as_ptr().add(band.band_offset as usize) };
        let ring = unsafe { SlotRing::new(band, buffer_ptr) };

        Some(BandPartition {
            ring,
            band_id,
            capacity: band.capacity as usize,
        })
    }

    /// Get the total used memory in bytes
    pub fn used_memory(&self) -> usize {
        let mut max_offset = Self::header_size();

        unsafe {
            for band in (*self.header).bands.iter() {
                if band.capacity != 0 {
                    let end = band.band_offset as usize
                        + SlotRing::band_size(band.capacity as usize, band.slot_bytes as usize);
                    max_offset = max_offset.max(end);
                }
            }
        }

        max_offset
    }

    // Get the total available memory in bytes
    pub fn available_memory(&self) -> usize {
        self.shm.size().saturating_sub(self.used_memory())
    }

    /// Retire a band. Peers attached to it observe it as closed.
    ///
    /// The band's memory is not reused; band ids are never recycled.
    pub fn remove_band(&self, band_id: u32) -> io::Result<()> {
        if band_id >= MAX_BANDS as u32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Band ID out of bounds",
            ));
        }

        let _guard = self.allocation_mutex.lock();
        let band = unsafe { &(*self.header).bands[band_id as usize] };
        if band.capacity == 0 || band.flags.load(Ordering::Acquire) & BAND_RETIRED != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Band not initialized",
            ));
        }

        // Capacity stays set so the band's region keeps counting as used.
        band.flags.fetch_or(BAND_CLOSED | BAND_RETIRED, Ordering::AcqRel);
        unsafe {
            (*self.header).band_count -= 1;
        }

        Ok(())
    }

    // Get the number of active bands
    pub fn band_count(&self) -> u32 {
        unsafe { (*self.header).band_count }
    }

    /// Name of the underlying segment
    pub fn segment_name(&self) -> &str {
        self.shm.name()
    }
}

impl BandPartition {
    /// Get the band ID
    pub fn id(&self) -> u32 {
        self.band_id
    }

    /// Get a reference to the underlying slot ring
    pub fn ring(&self) -> &SlotRing {
        &self.ring
    }
}

// Implement Send + Sync since we manage synchronization internally
unsafe impl Send for SegmentAllocator {}
unsafe impl Sync for SegmentAllocator {}
