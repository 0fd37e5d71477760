//! Double-buffered output sink.
//!
//! The producer fills preallocated units and hands them to a worker thread
//! that writes them out. Two queues carry the units around: the free list
//! (empty units, back to the producer) and the filled queue (to the worker).
//! The producer never waits longer than the configured bound; when the worker
//! falls behind the unit is dropped and reported as an overload instead.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::SinkConfig;
use crate::error::{FlowError, FlowResult, TransportFault};
use crate::Core::sync::BlockingQueue;

/// Consumes filled units on the worker thread.
pub trait SinkWriter<T>: Send {
    fn write(&mut self, unit: &T) -> FlowResult<()>;

    /// Called once after the last unit.
    fn flush(&mut self) -> FlowResult<()> {
        Ok(())
    }
}

impl<T, F> SinkWriter<T> for F
where
    F: FnMut(&T) -> FlowResult<()> + Send,
{
    fn write(&mut self, unit: &T) -> FlowResult<()> {
        self(unit)
    }
}

/// Counters handed back by [`DoubleBufferedSink::finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub written: u64,
    /// Acquire attempts that found no free unit in time.
    pub dropped: u64,
    pub write_errors: u64,
}

#[derive(Default)]
struct WorkerTally {
    written: u64,
    write_errors: u64,
}

pub struct DoubleBufferedSink<T: Send + 'static> {
    name: String,
    free: Arc<BlockingQueue<T>>,
    filled: Arc<BlockingQueue<T>>,
    max_wait: Duration,
    dropped: AtomicU64,
    worker: Option<JoinHandle<WorkerTally>>,
}

impl<T: Send + 'static> DoubleBufferedSink<T> {
    /// Start the worker over the given preallocated units.
    pub fn new<W>(name: impl Into<String>, units: Vec<T>, max_wait: Duration, writer: W) -> FlowResult<Self>
    where
        W: SinkWriter<T> + 'static,
    {
        if units.is_empty() {
            return Err(FlowError::Config("sink needs at least one buffer".into()));
        }
        let name = name.into();
        let free = Arc::new(BlockingQueue::with_capacity(units.len()));
        let filled = Arc::new(BlockingQueue::with_capacity(units.len()));
        for unit in units {
            let _ = free.push(unit);
        }

        let worker = {
            let free = free.clone();
            let filled = filled.clone();
            let name = name.clone();
            thread::Builder::new()
                .name(format!("sink-{name}"))
                .spawn(move || drain(&name, &free, &filled, writer))
                .map_err(|e| FlowError::Config(format!("cannot start sink worker: {e}")))?
        };
        tracing::info!(sink = %name, "sink worker started");

        Ok(Self {
            name,
            free,
            filled,
            max_wait,
            dropped: AtomicU64::new(0),
            worker: Some(worker),
        })
    }

    pub fn from_config<W>(
        name: impl Into<String>,
        config: &SinkConfig,
        mut make: impl FnMut() -> T,
        writer: W,
    ) -> FlowResult<Self>
    where
        W: SinkWriter<T> + 'static,
    {
        let units = (0..config.buffers).map(|_| make()).collect();
        Self::new(name, units, config.max_wait(), writer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take a free unit, waiting at most the configured bound.
    ///
    /// Each attempt that runs out of time counts one dropped unit and
    /// returns `Overload`.
    pub fn acquire(&self) -> FlowResult<SinkSlot<'_, T>> {
        if self.filled.is_closed() {
            return Err(FlowError::transport(
                self.name.as_str(),
                TransportFault::Closed,
                "sink no longer accepts iterations",
            ));
        }
        match self.free.pop_timeout(self.max_wait) {
            Some(unit) => Ok(SinkSlot {
                sink: self,
                unit: Some(unit),
            }),
            None => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(sink = %self.name, dropped, "no free buffer, dropping output");
                Err(FlowError::overload(
                    format!("sink {}", self.name),
                    format!("no free buffer within {:?}", self.max_wait),
                ))
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Units waiting for the worker.
    pub fn backlog(&self) -> usize {
        self.filled.len()
    }

    /// Stop accepting units; the worker drains what is queued and exits.
    pub fn no_more_iterations(&self) {
        self.filled.close();
    }

    /// Drain, join the worker and report.
    pub fn finish(mut self) -> SinkReport {
        self.no_more_iterations();
        let tally = self.join_worker();
        let report = SinkReport {
            written: tally.written,
            dropped: self.dropped(),
            write_errors: tally.write_errors,
        };
        tracing::info!(sink = %self.name, ?report, "sink finished");
        report
    }

    fn join_worker(&mut self) -> WorkerTally {
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(tally)) => tally,
            Some(Err(_)) => {
                tracing::error!(sink = %self.name, "sink worker panicked");
                WorkerTally::default()
            }
            None => WorkerTally::default(),
        }
    }

    fn recycle(&self, unit: T) {
        let _ = self.free.push(unit);
    }
}

impl<T: Send + 'static> Drop for DoubleBufferedSink<T> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.no_more_iterations();
            self.join_worker();
        }
    }
}

fn drain<T, W: SinkWriter<T>>(name: &str, free: &BlockingQueue<T>, filled: &BlockingQueue<T>, mut writer: W) -> WorkerTally {
    let mut tally = WorkerTally::default();
    while let Some(unit) = filled.pop() {
        match writer.write(&unit) {
            Ok(()) => tally.written += 1,
            Err(err) => {
                tally.write_errors += 1;
                tracing::warn!(sink = %name, error = %err, "sink write failed");
            }
        }
        let _ = free.push(unit);
    }
    if let Err(err) = writer.flush() {
        tally.write_errors += 1;
        tracing::warn!(sink = %name, error = %err, "sink flush failed");
    }
    tracing::debug!(sink = %name, written = tally.written, "sink worker drained");
    tally
}

/// A free unit on loan to the producer.
///
/// [`commit`](Self::commit) queues it for writing; dropping it returns it to
/// the free list unwritten.
pub struct SinkSlot<'a, T: Send + 'static> {
    sink: &'a DoubleBufferedSink<T>,
    unit: Option<T>,
}

impl<T: Send + 'static> SinkSlot<'_, T> {
    pub fn commit(mut self) -> FlowResult<()> {
        let Some(unit) = self.unit.take() else {
            return Ok(());
        };
        if let Err(unit) = self.sink.filled.push(unit) {
            self.sink.recycle(unit);
            return Err(FlowError::transport(
                self.sink.name.as_str(),
                TransportFault::Closed,
                "sink closed before commit",
            ));
        }
        Ok(())
    }
}

impl<T: Send + 'static> Deref for SinkSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `commit` empties the slot, and it consumes it.
        match &self.unit {
            Some(unit) => unit,
            None => unreachable!("sink slot used after commit"),
        }
    }
}

impl<T: Send + 'static> DerefMut for SinkSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.unit {
            Some(unit) => unit,
            None => unreachable!("sink slot used after commit"),
        }
    }
}

impl<T: Send + 'static> Drop for SinkSlot<'_, T> {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            self.sink.recycle(unit);
        }
    }
}
