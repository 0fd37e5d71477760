// Shared memory backend abstraction for Linux
// Named segments live in /dev/shm so unrelated processes can attach by name.

use std::fmt::Debug;
use std::io;

/// Shared memory backend trait for cross-platform memory mapping
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the underlying file descriptor
    fn raw_handle(&self) -> RawHandle;

    /// Name of the segment under /dev/shm
    fn name(&self) -> &str;
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy)]
pub enum RawHandle {
    /// Unix file descriptor (Linux)
    Fd(i32),
}

/// Round `size` up to the 128-byte stride used by every shared structure.
#[inline]
pub fn align_up(size: usize) -> usize {
    (size + 127) & !127
}

/// Create (or truncate) a named shared memory segment of `size` bytes.
///
/// The returned mapping is zero-filled.
#[cfg(target_os = "linux")]
pub fn create_shared_memory(size: usize, name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

/// Attach to an existing named segment of at least `size` bytes.
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(name: &str, size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name, size)?))
}

/// Remove a named segment. Existing mappings stay valid until dropped.
#[cfg(target_os = "linux")]
pub fn unlink_shared_memory(name: &str) -> io::Result<()> {
    match std::fs::remove_file(segment_path(name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(_size: usize, _name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(_name: &str, _size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn unlink_shared_memory(_name: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
fn segment_path(name: &str) -> String {
    format!("/dev/shm/{}", name)
}

#[cfg(target_os = "linux")]
pub use linux::LinuxSharedMemory;

#[cfg(target_os = "linux")]
mod linux {
    use super::{segment_path, RawHandle, SharedMemoryBackend};
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::fd::{AsRawFd, IntoRawFd};
    use std::os::unix::fs::OpenOptionsExt;
    use std::ptr::{self, NonNull};

    #[derive(Debug)]
    pub struct LinuxSharedMemory {
        ptr: NonNull<u8>,
        size: usize,
        fd: i32,
        name: String,
    }

    unsafe impl Send for LinuxSharedMemory {}
    unsafe impl Sync for LinuxSharedMemory {}

    impl LinuxSharedMemory {
        /// Create a new shared memory region using /dev/shm
        pub fn create(size: usize, name: &str) -> io::Result<Self> {
            let path = segment_path(name);

            // Create or truncate the file in /dev/shm
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)
                .map_err(|e| {
                    io::Error::new(
                        e.kind(),
                        format!("Failed to create shared memory file at {}: {}", path, e),
                    )
                })?;

            file.set_len(size as u64)?;
            Self::map(file, size, name)
        }

        /// Attach to a segment previously created by [`create`](Self::create).
        pub fn attach(name: &str, expected_size: usize) -> io::Result<Self> {
            let path = segment_path(name);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("Failed to open shared memory at {}: {}", path, e),
                    )
                })?;

            let actual_size = file.metadata()?.len() as usize;
            if actual_size < expected_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Shared memory too small: expected at least {}, got {}",
                        expected_size, actual_size
                    ),
                ));
            }
            Self::map(file, actual_size, name)
        }

        fn map(file: File, size: usize, name: &str) -> io::Result<Self> {
            if size == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Cannot map an empty shared memory segment",
                ));
            }

            // mmap returns page-aligned memory, which covers the 128-byte
            // alignment every shared structure assumes.
            let raw = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            let ptr = NonNull::new(raw as *mut u8).ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping")
            })?;

            Ok(Self {
                ptr,
                size,
                // Keep the file descriptor alive for the mapping's lifetime
                fd: file.into_raw_fd(),
                name: name.to_string(),
            })
        }
    }

    impl Drop for LinuxSharedMemory {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
                libc::close(self.fd);
            }
        }
    }

    impl SharedMemoryBackend for LinuxSharedMemory {
        fn as_ptr(&self) -> *mut u8 {
            self.ptr.as_ptr()
        }

        fn size(&self) -> usize {
            self.size
        }

        fn raw_handle(&self) -> RawHandle {
            RawHandle::Fd(self.fd)
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}
