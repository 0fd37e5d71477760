// Sequence-numbered slot ring living inside one band of a shared segment.

use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::time::Duration;

use super::layout::{BandEntry, SlotHeader, BAND_CLOSED};
use crate::Core::futex;

/// A lock-free, multi-producer, multi-consumer slot ring view.
///
/// This struct is NOT stored in shared memory. It is a transient view that holds
/// pointers to the shared memory region.
///
/// ### Concurrency Design:
/// - **Producers (Enqueue)**: Producers claim a slot by atomically incrementing `tail`.
///   They use the `sequence` field in the slot header to know when the slot is free to
///   be written.
/// - **Consumers (Dequeue)**: Consumers claim a slot by atomically incrementing `head`.
///   They use the `sequence` field to know when a slot has been fully written by a producer.
pub struct SlotRing {
    /// Pointer to the band metadata in the segment header.
    pub(crate) metadata: *const BandEntry,

    /// Pointer to the start of this band's slots.
    pub(crate) buffer_base: *mut u8,

    /// The capacity of the ring (number of slots).
    pub(crate) capacity: usize,

    /// `capacity - 1`, wraps sequence numbers onto slot indices.
    pub(crate) mask: usize,

    /// Usable payload bytes per slot.
    pub(crate) slot_bytes: usize,

    /// Distance between two slots in bytes.
    pub(crate) stride: usize,
}

unsafe impl Send for SlotRing {}
unsafe impl Sync for SlotRing {}

impl SlotRing {
    /// Create a ring view over an existing band.
    ///
    /// # Safety
    /// Caller must ensure `metadata` and `buffer_base` are valid pointers to
    /// the band entry and its slot area, and outlive the view.
    pub unsafe fn new(metadata: *const BandEntry, buffer_base: *mut u8) -> Self {
        let capacity = (*metadata).capacity as usize;
        let slot_bytes = (*metadata).slot_bytes as usize;
        Self {
            metadata,
            buffer_base,
            capacity,
            mask: capacity - 1,
            slot_bytes,
            stride: Self::stride_for(slot_bytes),
        }
    }

    /// Size in bytes of one slot (header + payload) rounded to a cache line.
    #[inline]
    pub fn stride_for(slot_bytes: usize) -> usize {
        (size_of::<SlotHeader>() + slot_bytes + 63) & !63
    }

    /// Bytes needed for a band of `capacity` slots.
    #[inline]
    pub fn band_size(capacity: usize, slot_bytes: usize) -> usize {
        capacity * Self::stride_for(slot_bytes)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Initialize per-slot sequence numbers to k for k in 0..capacity.
    /// This should ONLY be called by the creator of the band.
    ///
    /// # Safety
    /// Caller guarantees the underlying memory is allocated and writable.
    pub unsafe fn init_slots(&self) {
        for k in 0..self.capacity {
            let slot = self.slot_mut(k);
            (*slot).sequence.store(k as u64, Relaxed);
            (*slot).len = 0;
            (*slot).flags = 0;
        }
    }

    #[inline]
    unsafe fn slot_mut(&self, index: usize) -> *mut SlotHeader {
        self.buffer_base.add(index * self.stride) as *mut SlotHeader
    }

    #[inline]
    unsafe fn payload_ptr(slot: *mut SlotHeader) -> *mut u8 {
        (slot as *mut u8).add(size_of::<SlotHeader>())
    }

    #[inline]
    fn entry(&self) -> &BandEntry {
        // Safety: the view never outlives the band it was created over.
        unsafe { &*self.metadata }
    }

    /// Reserve a slot and publish `payload` with `flags`.
    /// Returns the slot index on success, or None if the ring appears full.
    /// Payloads longer than `slot_bytes` are truncated; callers fragment first.
    pub fn enqueue(&self, payload: &[u8], flags: u32) -> Option<usize> {
        let tail_atomic = &self.entry().tail;

        loop {
            let tail = tail_atomic.load(Relaxed);
            let idx = (tail as usize) & self.mask;
            let slot_ptr = unsafe { self.slot_mut(idx) };
            let seq = unsafe { &(*slot_ptr).sequence }.load(Acquire);
            let dif = seq as i64 - tail as i64;

            if dif == 0 {
                if tail_atomic
                    .compare_exchange_weak(tail, tail + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    // We own this slot now
                    let len = payload.len().min(self.slot_bytes);
                    unsafe {
                        (*slot_ptr).len = len as u32;
                        (*slot_ptr).flags = flags;
                        ptr::copy_nonoverlapping(payload.as_ptr(), Self::payload_ptr(slot_ptr), len);

                        // Publish
                        (*slot_ptr).sequence.store(tail + 1, Release);
                    }
                    return Some(idx);
                }
                continue;
            } else if dif < 0 {
                // full
                return None;
            } else {
                // someone else is producing; backoff and retry
                std::hint::spin_loop();
                continue;
            }
        }
    }

    /// Acquire a ready slot and append its content to `out`.
    /// Returns the slot flags, or None if the ring appears empty.
    pub fn dequeue_into(&self, out: &mut Vec<u8>) -> Option<u32> {
        let head_atomic = &self.entry().head;

        loop {
            let head = head_atomic.load(Relaxed);
            let idx = (head as usize) & self.mask;
            let slot_ptr = unsafe { self.slot_mut(idx) };
            let seq = unsafe { &(*slot_ptr).sequence }.load(Acquire);
            let dif = seq as i64 - (head as i64 + 1);

            if dif == 0 {
                if head_atomic
                    .compare_exchange_weak(head, head + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    let flags = unsafe {
                        let len = ((*slot_ptr).len as usize).min(self.slot_bytes);
                        let src = std::slice::from_raw_parts(Self::payload_ptr(slot_ptr), len);
                        out.extend_from_slice(src);
                        (*slot_ptr).flags
                    };

                    // free slot for future producers
                    unsafe {
                        (*slot_ptr).sequence.store(head + self.capacity as u64, Release);
                    }
                    return Some(flags);
                }
                continue;
            } else if dif < 0 {
                // empty
                return None;
            } else {
                // producer not finished; retry
                std::hint::spin_loop();
                continue;
            }
        }
    }

    /// Number of published-but-unconsumed slots (approximate under contention).
    pub fn len(&self) -> usize {
        let entry = self.entry();
        let tail = entry.tail.load(Acquire);
        let head = entry.head.load(Acquire);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.entry().flags.load(Acquire) & BAND_CLOSED != 0
    }

    /// Mark the band closed and wake everybody blocked on it.
    pub fn mark_closed(&self) {
        let entry = self.entry();
        entry.flags.fetch_or(BAND_CLOSED, AcqRel);
        entry.data_signal.fetch_add(1, Release);
        entry.space_signal.fetch_add(1, Release);
        futex::futex_wake_all(&entry.data_signal);
        futex::futex_wake_all(&entry.space_signal);
    }

    /// Signal consumers that new data is available
    pub fn signal_consumer(&self) {
        let signal = &self.entry().data_signal;
        signal.fetch_add(1, Release);
        futex::futex_wake(signal);
    }

    /// Signal producers that a slot was freed
    pub fn signal_producer(&self) {
        let signal = &self.entry().space_signal;
        signal.fetch_add(1, Release);
        futex::futex_wake(signal);
    }

    /// Wait for new data, at most `timeout`. Returns `false` on timeout.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let signal = &self.entry().data_signal;
        let val = signal.load(Acquire);
        if !self.is_empty() || self.is_closed() {
            return true;
        }
        futex::futex_wait_timeout(signal, val, timeout)
    }

    /// Wait for a free slot, at most `timeout`. Returns `false` on timeout.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        let signal = &self.entry().space_signal;
        let val = signal.load(Acquire);
        if self.len() < self.capacity || self.is_closed() {
            return true;
        }
        futex::futex_wait_timeout(signal, val, timeout)
    }
}
