//! Real-time boundary: time-pointer synchronisation and the ring built on it.

pub mod ring;
pub mod sync_rw;

pub use ring::{RealtimeRing, Synchronizer};
pub use sync_rw::{ReadWindow, StreamClock, SynchronizedReaderWriter, Timestamp, WallClockReaderWriter};
