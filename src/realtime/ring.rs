// Time-indexed ring of units, one unit per block of stream time.

use std::time::Duration;

use parking_lot::Mutex;

use super::sync_rw::{ReadWindow, StreamClock, SynchronizedReaderWriter, Timestamp, WallClockReaderWriter};
use crate::config::{RingConfig, SyncMode};
use crate::error::{FlowError, FlowResult};

/// The pointer synchroniser behind a [`RealtimeRing`].
pub enum Synchronizer {
    Bounded(SynchronizedReaderWriter),
    WallClock(WallClockReaderWriter),
}

impl Synchronizer {
    pub fn capacity(&self) -> i64 {
        match self {
            Synchronizer::Bounded(sync) => sync.capacity(),
            Synchronizer::WallClock(sync) => sync.capacity(),
        }
    }

    pub fn pointers(&self) -> (Timestamp, Timestamp) {
        match self {
            Synchronizer::Bounded(sync) => sync.pointers(),
            Synchronizer::WallClock(sync) => sync.pointers(),
        }
    }

    pub fn overloads(&self) -> u64 {
        match self {
            Synchronizer::Bounded(sync) => sync.overloads(),
            Synchronizer::WallClock(sync) => sync.overloads(),
        }
    }
}

struct Slot<T> {
    /// Start time of the block the slot currently holds.
    time: Option<Timestamp>,
    unit: T,
}

/// Fixed array of slots indexed by `time / block_len`.
///
/// Writers fill whole blocks, readers consume whole blocks; the synchroniser
/// keeps the writer from lapping the reader. Each slot has its own lock so a
/// reader and a writer working on different blocks never contend.
pub struct RealtimeRing<T> {
    slots: Vec<Mutex<Slot<T>>>,
    block_len: i64,
    sync: Synchronizer,
}

impl<T> RealtimeRing<T> {
    pub fn new(units: Vec<T>, block_len: i64, sync: Synchronizer) -> FlowResult<Self> {
        if block_len <= 0 || units.is_empty() {
            return Err(FlowError::Config("ring needs at least one slot and a positive block length".into()));
        }
        let span = block_len * units.len() as i64;
        if span != sync.capacity() {
            return Err(FlowError::Config(format!(
                "{} slots of {block_len} cover {span}, synchroniser capacity is {}",
                units.len(),
                sync.capacity()
            )));
        }
        let slots = units
            .into_iter()
            .map(|unit| Mutex::new(Slot { time: None, unit }))
            .collect();
        Ok(Self { slots, block_len, sync })
    }

    /// Build the ring described by `config`, starting at stream time `start`.
    pub fn from_config(config: &RingConfig, start: Timestamp, mut make: impl FnMut() -> T) -> FlowResult<Self> {
        config.validate()?;
        let count = (config.capacity / config.block_len) as usize;
        let units = (0..count).map(|_| make()).collect();
        let sync = match config.mode {
            SyncMode::Bounded => Synchronizer::Bounded(SynchronizedReaderWriter::new(config.capacity, start)),
            SyncMode::WallClock => Synchronizer::WallClock(WallClockReaderWriter::new(
                config.capacity,
                start,
                StreamClock::starting_now(start, config.units_per_second),
                config.max_network_delay(),
                config.missing_data,
            )),
        };
        Self::new(units, config.block_len, sync)
    }

    pub fn block_len(&self) -> i64 {
        self.block_len
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn overloads(&self) -> u64 {
        self.sync.overloads()
    }

    fn slot_of(&self, time: Timestamp) -> FlowResult<&Mutex<Slot<T>>> {
        if time % self.block_len != 0 {
            return Err(FlowError::layout(format!(
                "time {time} is not aligned to block length {}",
                self.block_len
            )));
        }
        let index = (time / self.block_len).rem_euclid(self.slots.len() as i64) as usize;
        Ok(&self.slots[index])
    }

    /// Fill the block starting at `time`.
    ///
    /// Bounded rings wait for room. Wall-clock rings never wait: a block
    /// with no room, or one the reader already gave up on, is dropped and
    /// reported as `Overload`.
    pub fn write(&self, time: Timestamp, fill: impl FnOnce(&mut T)) -> FlowResult<()> {
        let slot = self.slot_of(time)?;
        let end = time + self.block_len;
        match &self.sync {
            Synchronizer::Bounded(sync) => sync.start_write(time, end),
            Synchronizer::WallClock(sync) => {
                if !sync.start_write(time, end) {
                    return Err(FlowError::overload(
                        "realtime ring",
                        format!("block [{time}, {end}) dropped"),
                    ));
                }
            }
        }
        {
            let mut slot = slot.lock();
            fill(&mut slot.unit);
            slot.time = Some(time);
        }
        match &self.sync {
            Synchronizer::Bounded(sync) => sync.finished_write(end),
            Synchronizer::WallClock(sync) => sync.finished_write(end),
        }
        Ok(())
    }

    /// Like [`write`](Self::write) for bounded rings, but refuses instead of
    /// waiting when the block would overwrite unread data.
    pub fn try_write(&self, time: Timestamp, fill: impl FnOnce(&mut T)) -> FlowResult<()> {
        match &self.sync {
            Synchronizer::Bounded(sync) => {
                let slot = self.slot_of(time)?;
                let end = time + self.block_len;
                if !sync.try_start_write(time, end) {
                    return Err(FlowError::overload(
                        "realtime ring",
                        format!("no room for block [{time}, {end})"),
                    ));
                }
                {
                    let mut slot = slot.lock();
                    fill(&mut slot.unit);
                    slot.time = Some(time);
                }
                sync.finished_write(end);
                Ok(())
            }
            Synchronizer::WallClock(_) => self.write(time, fill),
        }
    }

    /// Consume the block starting at `time`.
    ///
    /// Returns `None` when the block never arrived: the writer finished
    /// before reaching it, or (wall-clock rings) it missed its deadline under
    /// [`MissingDataPolicy::Tolerate`](crate::config::MissingDataPolicy::Tolerate).
    pub fn read<R>(&self, time: Timestamp, consume: impl FnOnce(&T) -> R) -> FlowResult<Option<R>> {
        let slot = self.slot_of(time)?;
        let end = time + self.block_len;
        let window = match &self.sync {
            Synchronizer::Bounded(sync) => {
                sync.start_read(time, end);
                None
            }
            Synchronizer::WallClock(sync) => Some(sync.start_read(time, end)?),
        };
        let result = {
            let slot = slot.lock();
            let present = slot.time == Some(time)
                && window.as_ref().map_or(true, |w: &ReadWindow| w.is_complete());
            present.then(|| consume(&slot.unit))
        };
        match &self.sync {
            Synchronizer::Bounded(sync) => sync.finished_read(end),
            Synchronizer::WallClock(sync) => sync.finished_read(end),
        }
        Ok(result)
    }

    /// Bounded read that gives up after `timeout`; `Ok(None)` on timeout.
    pub fn read_timeout<R>(
        &self,
        time: Timestamp,
        timeout: Duration,
        consume: impl FnOnce(&T) -> R,
    ) -> FlowResult<Option<R>> {
        match &self.sync {
            Synchronizer::Bounded(sync) => {
                let end = time + self.block_len;
                if !sync.start_read_timeout(time, end, timeout) {
                    return Ok(None);
                }
                self.read(time, consume)
            }
            Synchronizer::WallClock(_) => self.read(time, consume),
        }
    }

    pub fn no_more_writing(&self) {
        match &self.sync {
            Synchronizer::Bounded(sync) => sync.no_more_writing(),
            Synchronizer::WallClock(sync) => sync.no_more_writing(),
        }
    }

    pub fn no_more_reading(&self) {
        match &self.sync {
            Synchronizer::Bounded(sync) => sync.no_more_reading(),
            Synchronizer::WallClock(sync) => sync.no_more_reading(),
        }
    }
}
