// Shared memory backend, segment allocator and slot ring tests.
// Run with: cargo test --test shared_memory -- --nocapture

#[cfg(target_os = "linux")]
mod linux_tests {
    use rtflow::Core::alloc::SegmentAllocator;
    use rtflow::Core::{attach_shared_memory, create_shared_memory, unlink_shared_memory, RawHandle};
    use rtflow::Transport::shm::layout::FRAG_MORE;
    use serial_test::serial;
    use std::collections::HashSet;
    use std::io;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct Cleanup(&'static str);

    impl Drop for Cleanup {
        fn drop(&mut self) {
            let _ = unlink_shared_memory(self.0);
        }
    }

    #[test]
    #[serial]
    fn test_create_and_attach_share_bytes() {
        let name = "rtflow_test_create_attach";
        let _cleanup = Cleanup(name);

        let created = create_shared_memory(8192, name).unwrap();
        assert_eq!(created.size(), 8192);
        assert_eq!(created.name(), name);
        assert!(matches!(created.raw_handle(), RawHandle::Fd(fd) if fd >= 0));

        let attached = attach_shared_memory(name, 8192).unwrap();
        unsafe {
            let slice = std::slice::from_raw_parts_mut(created.as_ptr(), created.size());
            for (i, byte) in slice.iter_mut().take(100).enumerate() {
                *byte = (i % 256) as u8;
            }
            let view = std::slice::from_raw_parts(attached.as_ptr(), attached.size());
            for (i, byte) in view.iter().take(100).enumerate() {
                assert_eq!(*byte, (i % 256) as u8);
            }
        }
    }

    #[test]
    #[serial]
    fn test_attach_missing_segment_is_not_found() {
        let err = attach_shared_memory("rtflow_test_never_created", 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    #[serial]
    fn test_allocator_bands() -> io::Result<()> {
        let name = "rtflow_test_bands";
        let _cleanup = Cleanup(name);

        let allocator = SegmentAllocator::new(name, 1024 * 1024)?;
        assert!(allocator.is_initialized());
        assert!(allocator.get_band(0).is_none());
        assert!(allocator.shm().size() >= 1024 * 1024);
        let free = allocator.available_memory();

        let band = allocator.create_band(64, 256)?;
        assert!(allocator.available_memory() < free);
        assert_eq!(band.id(), 0);
        for expected in 1..5 {
            let band = allocator.create_band(16, 128)?;
            assert_eq!(band.id(), expected);
        }
        assert_eq!(allocator.band_count(), 5);
        assert!(allocator.get_band(999).is_none());
        println!("{allocator:?}");

        // Capacities must be powers of two.
        assert_eq!(
            allocator.create_band(3, 64).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );

        let used = allocator.used_memory();
        allocator.remove_band(2)?;
        assert!(allocator.get_band(2).is_none());
        assert_eq!(allocator.band_count(), 4);
        // Retired bands keep their region.
        assert_eq!(allocator.used_memory(), used);
        assert!(allocator.remove_band(2).is_err());
        Ok(())
    }

    #[test]
    #[serial]
    fn test_allocator_out_of_space() -> io::Result<()> {
        let name = "rtflow_test_out_of_space";
        let _cleanup = Cleanup(name);

        let allocator = SegmentAllocator::new(name, SegmentAllocator::header_size() + 4096)?;
        let err = allocator.create_band(1024, 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_attached_allocator_sees_bands() -> io::Result<()> {
        let name = "rtflow_test_attach_bands";
        let _cleanup = Cleanup(name);

        let owner = SegmentAllocator::new(name, 256 * 1024)?;
        let band = owner.create_band(8, 64)?;
        band.ring().enqueue(b"hello", 0).expect("ring has room");

        let guest = SegmentAllocator::attach(name, 256 * 1024)?;
        let seen = guest.get_band(band.id()).expect("band visible through attach");
        let mut out = Vec::new();
        assert_eq!(seen.ring().dequeue_into(&mut out), Some(0));
        assert_eq!(out, b"hello");
        Ok(())
    }

    #[test]
    #[serial]
    fn test_slot_ring_fifo_full_and_flags() -> io::Result<()> {
        let name = "rtflow_test_ring_fifo";
        let _cleanup = Cleanup(name);

        let allocator = SegmentAllocator::new(name, 256 * 1024)?;
        let band = allocator.create_band(4, 32)?;
        let ring = band.ring();
        assert_eq!(ring.capacity(), 4);
        assert_eq!(ring.slot_bytes(), 32);

        for i in 0..4u8 {
            let flags = if i % 2 == 0 { FRAG_MORE } else { 0 };
            assert!(ring.enqueue(&[i; 10], flags).is_some());
        }
        assert!(ring.enqueue(&[9; 10], 0).is_none(), "ring should be full");
        assert_eq!(ring.len(), 4);
        assert!(!ring.wait_for_space(Duration::from_millis(5)));

        let mut out = Vec::new();
        for i in 0..4u8 {
            out.clear();
            let flags = ring.dequeue_into(&mut out).expect("published slot");
            assert_eq!(out, vec![i; 10]);
            assert_eq!(flags & FRAG_MORE != 0, i % 2 == 0);
        }
        assert!(ring.dequeue_into(&mut out).is_none());
        assert!(!ring.wait_for_data(Duration::from_millis(5)));

        ring.mark_closed();
        assert!(ring.is_closed());
        assert!(ring.wait_for_data(Duration::from_millis(5)));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_slot_ring_concurrent_producers() -> io::Result<()> {
        let name = "rtflow_test_ring_mpmc";
        let _cleanup = Cleanup(name);

        let allocator = Arc::new(SegmentAllocator::new(name, 1024 * 1024)?);
        let band_id = allocator.create_band(64, 16)?.id();
        let producers = 4;
        let per_producer = 500u32;

        let mut handles = Vec::new();
        for p in 0..producers {
            let allocator = allocator.clone();
            handles.push(thread::spawn(move || {
                let band = allocator.get_band(band_id).unwrap();
                for i in 0..per_producer {
                    let value = p * per_producer + i;
                    while band.ring().enqueue(&value.to_le_bytes(), 0).is_none() {
                        band.ring().wait_for_space(Duration::from_millis(1));
                    }
                    band.ring().signal_consumer();
                }
            }));
        }

        let band = allocator.get_band(band_id).unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        while seen.len() < (producers * per_producer) as usize {
            out.clear();
            if band.ring().dequeue_into(&mut out).is_some() {
                band.ring().signal_producer();
                let value = u32::from_le_bytes(out[..4].try_into().unwrap());
                assert!(seen.insert(value), "value {value} delivered twice");
            } else {
                band.ring().wait_for_data(Duration::from_millis(1));
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        println!("received {} distinct values", seen.len());
        Ok(())
    }
}
