//! Time-pointer synchronisation between one reader and one writer.
//!
//! Both pointers are stream times ([`Timestamp`]) and only move forward. The
//! observed distance `write - read` always lies in `[0, capacity]`: the read
//! pointer never passes data that was not written, the write pointer never
//! laps data that was not read.

use std::ops::Range;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::MissingDataPolicy;
use crate::error::{FlowError, FlowResult};

/// Stream time, in samples or any other monotonically increasing unit.
pub type Timestamp = i64;

#[derive(Debug)]
struct Pointers {
    read: Timestamp,
    write: Timestamp,
    /// Where the reader asked to be; `read` catches up as data arrives.
    read_request: Timestamp,
    /// Where the writer asked to be; `write` catches up as room appears.
    write_request: Timestamp,
    reading_done: bool,
    writing_done: bool,
    overloads: u64,
}

impl Pointers {
    fn new(start: Timestamp) -> Self {
        Self {
            read: start,
            write: start,
            read_request: start,
            write_request: start,
            reading_done: false,
            writing_done: false,
            overloads: 0,
        }
    }

    fn room_until(&self, capacity: i64) -> Timestamp {
        if self.reading_done {
            Timestamp::MAX
        } else {
            self.read.saturating_add(capacity)
        }
    }

    /// Move both pointers as far towards their requests as the bounds allow.
    fn settle(&mut self, capacity: i64) {
        loop {
            let write = self.write.max(self.write_request.min(self.room_until(capacity)));
            let mut read = self.read.max(self.read_request.min(write));
            if self.reading_done {
                // Nobody reads any more; drag the read pointer along.
                read = read.max(write.saturating_sub(capacity));
            }
            if write == self.write && read == self.read {
                return;
            }
            self.write = write;
            self.read = read;
        }
    }
}

/// Blocks until the condition holds, the deadline passes (`false`), or
/// forever when there is no deadline.
fn wait_for(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, Pointers>,
    deadline: Option<Instant>,
    mut ready: impl FnMut(&Pointers) -> bool,
) -> bool {
    while !ready(&**guard) {
        match deadline {
            None => cond.wait(guard),
            Some(deadline) => {
                if cond.wait_until(guard, deadline).timed_out() {
                    return ready(&**guard);
                }
            }
        }
    }
    true
}

/// Bounded reader/writer synchronisation: each side waits for the other.
pub struct SynchronizedReaderWriter {
    capacity: i64,
    state: Mutex<Pointers>,
    changed: Condvar,
}

impl SynchronizedReaderWriter {
    pub fn new(capacity: i64, start: Timestamp) -> Self {
        Self {
            capacity,
            state: Mutex::new(Pointers::new(start)),
            changed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Advance the read pointer to `begin`, then wait until `[begin, end)`
    /// has been written.
    pub fn start_read(&self, begin: Timestamp, end: Timestamp) {
        self.start_read_until(begin, end, None);
    }

    /// [`start_read`](Self::start_read) with a bound; `false` on timeout.
    pub fn start_read_timeout(&self, begin: Timestamp, end: Timestamp, timeout: Duration) -> bool {
        self.start_read_until(begin, end, Some(Instant::now() + timeout))
    }

    fn start_read_until(&self, begin: Timestamp, end: Timestamp, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        state.read_request = state.read_request.max(begin);
        state.settle(self.capacity);
        self.changed.notify_all();
        wait_for(&self.changed, &mut state, deadline, |p| p.write >= end || p.writing_done)
    }

    /// Commit reading up to `advance_to` without waiting.
    pub fn finished_read(&self, advance_to: Timestamp) {
        let mut state = self.state.lock();
        state.read_request = state.read_request.max(advance_to);
        state.settle(self.capacity);
        self.changed.notify_all();
    }

    /// Advance the write pointer to `begin`, then wait until `[begin, end)`
    /// no longer holds unread data.
    pub fn start_write(&self, begin: Timestamp, end: Timestamp) {
        self.start_write_until(begin, end, None);
    }

    pub fn start_write_timeout(&self, begin: Timestamp, end: Timestamp, timeout: Duration) -> bool {
        self.start_write_until(begin, end, Some(Instant::now() + timeout))
    }

    fn start_write_until(&self, begin: Timestamp, end: Timestamp, deadline: Option<Instant>) -> bool {
        let capacity = self.capacity;
        let mut state = self.state.lock();
        state.write_request = state.write_request.max(begin);
        state.settle(capacity);
        self.changed.notify_all();
        wait_for(&self.changed, &mut state, deadline, |p| {
            p.reading_done || p.read >= end - capacity
        })
    }

    /// Non-blocking write start: refuses, counting one overload, when
    /// `[begin, end)` would overwrite unread data.
    pub fn try_start_write(&self, begin: Timestamp, end: Timestamp) -> bool {
        let mut state = self.state.lock();
        if !state.reading_done && state.read < end - self.capacity {
            state.overloads += 1;
            tracing::warn!(begin, end, read = state.read, "ring full, write refused");
            return false;
        }
        state.write_request = state.write_request.max(begin);
        state.settle(self.capacity);
        self.changed.notify_all();
        true
    }

    /// Commit writing up to `advance_to` without waiting.
    pub fn finished_write(&self, advance_to: Timestamp) {
        let mut state = self.state.lock();
        state.write_request = state.write_request.max(advance_to);
        state.settle(self.capacity);
        self.changed.notify_all();
    }

    /// Release the writer for good; it no longer waits for room and the
    /// read pointer follows it at `capacity` distance.
    pub fn no_more_reading(&self) {
        let mut state = self.state.lock();
        state.reading_done = true;
        state.settle(self.capacity);
        self.changed.notify_all();
    }

    /// Release the reader for good; it no longer waits for data.
    pub fn no_more_writing(&self) {
        let mut state = self.state.lock();
        state.writing_done = true;
        self.changed.notify_all();
    }

    pub fn read_pointer(&self) -> Timestamp {
        self.state.lock().read
    }

    pub fn write_pointer(&self) -> Timestamp {
        self.state.lock().write
    }

    /// `(read, write)` observed atomically.
    pub fn pointers(&self) -> (Timestamp, Timestamp) {
        let state = self.state.lock();
        (state.read, state.write)
    }

    pub fn overloads(&self) -> u64 {
        self.state.lock().overloads
    }

    pub fn is_writing_done(&self) -> bool {
        self.state.lock().writing_done
    }
}

/// Maps stream time onto wall-clock instants.
#[derive(Debug, Clone, Copy)]
pub struct StreamClock {
    origin: Instant,
    origin_time: Timestamp,
    units_per_second: f64,
}

impl StreamClock {
    /// Stream time `origin_time` happens at `origin`.
    pub fn new(origin: Instant, origin_time: Timestamp, units_per_second: f64) -> Self {
        Self {
            origin,
            origin_time,
            units_per_second,
        }
    }

    pub fn starting_now(origin_time: Timestamp, units_per_second: f64) -> Self {
        Self::new(Instant::now(), origin_time, units_per_second)
    }

    /// Wall-clock instant at which stream time `t` has happened.
    pub fn instant_of(&self, t: Timestamp) -> Instant {
        let units = (t - self.origin_time) as f64;
        if units <= 0.0 {
            return self.origin;
        }
        self.origin + Duration::from_secs_f64(units / self.units_per_second)
    }
}

/// Result of a wall-clock gated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadWindow {
    pub begin: Timestamp,
    pub end: Timestamp,
    /// Part of the window the writer never delivered in time.
    pub missing: Option<Range<Timestamp>>,
}

impl ReadWindow {
    pub fn is_complete(&self) -> bool {
        self.missing.is_none()
    }
}

/// Wall-clock gated synchronisation for live feeds.
///
/// The reader waits for data until the wall-clock time of the window's end
/// plus a fixed network-delay allowance, then moves on; whatever did not
/// arrive is reported missing and later writes into it are dropped. The
/// writer never waits: a write with no room is dropped and counted.
pub struct WallClockReaderWriter {
    capacity: i64,
    clock: StreamClock,
    max_network_delay: Duration,
    policy: MissingDataPolicy,
    state: Mutex<Pointers>,
    changed: Condvar,
    missing_windows: Mutex<u64>,
}

impl WallClockReaderWriter {
    pub fn new(
        capacity: i64,
        start: Timestamp,
        clock: StreamClock,
        max_network_delay: Duration,
        policy: MissingDataPolicy,
    ) -> Self {
        Self {
            capacity,
            clock,
            max_network_delay,
            policy,
            state: Mutex::new(Pointers::new(start)),
            changed: Condvar::new(),
            missing_windows: Mutex::new(0),
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn policy(&self) -> MissingDataPolicy {
        self.policy
    }

    /// Wait for `[begin, end)` until its wall-clock deadline.
    ///
    /// Under [`MissingDataPolicy::Fatal`] an incomplete window is an error;
    /// otherwise it is reported in the returned [`ReadWindow`].
    pub fn start_read(&self, begin: Timestamp, end: Timestamp) -> FlowResult<ReadWindow> {
        let deadline = self.clock.instant_of(end) + self.max_network_delay;
        let mut state = self.state.lock();
        state.read_request = state.read_request.max(begin);
        state.settle(self.capacity);
        self.changed.notify_all();

        wait_for(&self.changed, &mut state, Some(deadline), |p| {
            p.write >= end || p.writing_done
        });

        if state.write >= end {
            return Ok(ReadWindow { begin, end, missing: None });
        }

        // Give up on the rest of the window; late writes into it are dropped.
        let missing = state.write.max(begin)..end;
        state.write_request = state.write_request.max(end);
        state.write = state.write.max(end);
        state.settle(self.capacity);
        self.changed.notify_all();
        drop(state);

        *self.missing_windows.lock() += 1;
        tracing::warn!(begin = missing.start, end = missing.end, "data missing at wall-clock deadline");
        match self.policy {
            MissingDataPolicy::Fatal => Err(FlowError::MissingData {
                begin: missing.start,
                end: missing.end,
            }),
            MissingDataPolicy::Tolerate => Ok(ReadWindow {
                begin,
                end,
                missing: Some(missing),
            }),
        }
    }

    pub fn finished_read(&self, advance_to: Timestamp) {
        let mut state = self.state.lock();
        state.read_request = state.read_request.max(advance_to);
        state.settle(self.capacity);
        self.changed.notify_all();
    }

    /// Admit a write of `[begin, end)`. Never waits: a window that would
    /// overwrite unread data, or that the reader already gave up on, is
    /// refused and counted as one overload.
    pub fn start_write(&self, begin: Timestamp, end: Timestamp) -> bool {
        let mut state = self.state.lock();
        let no_room = !state.reading_done && state.read < end - self.capacity;
        let too_late = begin < state.write;
        if no_room || too_late {
            state.overloads += 1;
            tracing::warn!(begin, end, read = state.read, write = state.write, "write dropped");
            return false;
        }
        state.write_request = state.write_request.max(begin);
        state.settle(self.capacity);
        true
    }

    pub fn finished_write(&self, advance_to: Timestamp) {
        let mut state = self.state.lock();
        state.write_request = state.write_request.max(advance_to);
        state.settle(self.capacity);
        self.changed.notify_all();
    }

    pub fn no_more_reading(&self) {
        let mut state = self.state.lock();
        state.reading_done = true;
        state.settle(self.capacity);
        self.changed.notify_all();
    }

    pub fn no_more_writing(&self) {
        let mut state = self.state.lock();
        state.writing_done = true;
        self.changed.notify_all();
    }

    pub fn pointers(&self) -> (Timestamp, Timestamp) {
        let state = self.state.lock();
        (state.read, state.write)
    }

    pub fn overloads(&self) -> u64 {
        self.state.lock().overloads
    }

    pub fn missing_windows(&self) -> u64 {
        *self.missing_windows.lock()
    }
}
