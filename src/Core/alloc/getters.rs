use super::*;
use std::sync::atomic::Ordering;

/// Getter methods for SegmentAllocator
///
/// These methods provide access to the private fields of SegmentAllocator
/// for debugging and monitoring purposes.
impl SegmentAllocator {
    /// Get a reference to the underlying shared memory backend
    pub fn shm(&self) -> &dyn SharedMemoryBackend {
        &*self.shm
    }

    /// Get the raw pointer to the SegmentHeader
    ///
    /// # Safety
    /// The caller must ensure the pointer is not used after the allocator is dropped
    pub fn header_ptr(&self) -> *const SegmentHeader {
        self.header
    }

    /// Get the next band ID that will be assigned.
    ///
    /// Loaded with relaxed ordering since this is primarily used
    /// for debugging and monitoring.
    pub fn next_band_id(&self) -> u64 {
        self.next_band_id.load(Ordering::Relaxed)
    }

    /// Check if the allocator is attached to an initialised segment
    ///
    /// Returns true if the magic number in the header matches the expected value.
    pub fn is_initialized(&self) -> bool {
        // Safety: the header pointer is valid while the allocator exists
        unsafe { !self.header.is_null() && (*self.header).magic == SEGMENT_MAGIC }
    }
}
