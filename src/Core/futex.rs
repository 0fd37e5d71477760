use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(target_os = "linux")]
fn futex_wait_raw(atomic: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    use std::ptr;
    use std::sync::atomic::Ordering;

    // Check condition first to avoid syscall if possible
    if atomic.load(Ordering::Relaxed) != expected {
        return true;
    }

    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map(|t| t as *const libc::timespec)
        .unwrap_or(ptr::null());

    // Shared (non-private) futex: the word may live in a segment mapped by
    // another process.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            atomic as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0u32,
        )
    };

    if rc == 0 {
        return true;
    }
    // EAGAIN: value already changed. EINTR: treat as spurious wake.
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    errno != libc::ETIMEDOUT
}

#[cfg(target_os = "linux")]
fn futex_wake_raw(atomic: &AtomicU32, count: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            atomic as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Block while `atomic == expected`.
#[cfg(target_os = "linux")]
pub fn futex_wait(atomic: &AtomicU32, expected: u32) {
    futex_wait_raw(atomic, expected, None);
}

/// Block while `atomic == expected`, at most `timeout`.
///
/// Returns `false` if the wait timed out.
#[cfg(target_os = "linux")]
pub fn futex_wait_timeout(atomic: &AtomicU32, expected: u32, timeout: Duration) -> bool {
    futex_wait_raw(atomic, expected, Some(timeout))
}

#[cfg(target_os = "linux")]
pub fn futex_wake(atomic: &AtomicU32) {
    futex_wake_raw(atomic, 1);
}

#[cfg(target_os = "linux")]
pub fn futex_wake_all(atomic: &AtomicU32) {
    futex_wake_raw(atomic, i32::MAX);
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_atomic: &AtomicU32, _expected: u32) {
    // Fallback for non-Linux: busy wait with yield
    std::thread::yield_now();
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait_timeout(atomic: &AtomicU32, expected: u32, timeout: Duration) -> bool {
    use std::sync::atomic::Ordering;

    let deadline = std::time::Instant::now() + timeout;
    while atomic.load(Ordering::Acquire) == expected {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_atomic: &AtomicU32) {
    // No-op on non-Linux
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake_all(_atomic: &AtomicU32) {
    // No-op on non-Linux
}
