//! Many-to-many asynchronous transpose.
//!
//! Each round every destination is sent one unit and every source delivers
//! one unit. A unit travels as [`Transposable::PARTS`] sub-messages, one tag
//! per part, so the small header and the bulk payload are independent
//! messages. Receive handles are kept per source and per part; a handle of
//! `None` marks finished work.

use std::time::{Duration, Instant};

use super::group::{RedistributionGroup, Role};
use super::interconnect::{tag_rank, Interconnect, Request};
use crate::error::{FlowError, FlowResult};
use crate::Buffer::Transposable;

/// Default tag of part 0; part `i` uses `tag_base + i`.
pub const DEFAULT_TAG_BASE: u32 = 0x5200;

/// Longest single wait on the interconnect before handles are re-tested.
const PROGRESS_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub rounds: u64,
    pub received: u64,
    pub sent: u64,
    pub failures: u64,
}

struct SendSlot<T> {
    unit: T,
    handles: Vec<Option<Request>>,
}

impl<T> SendSlot<T> {
    fn done(&self) -> bool {
        self.handles.iter().all(Option::is_none)
    }
}

pub struct RedistributionEngine<I: Interconnect, T: Transposable> {
    group: RedistributionGroup,
    interconnect: I,
    tag_base: u32,
    /// `[source][part]`; `None` once the part arrived or was abandoned.
    recv_handles: Vec<Vec<Option<Request>>>,
    /// Landing storage, reused every round.
    recv_parts: Vec<Vec<Vec<u8>>>,
    /// Whether the source still owes us a unit this round.
    awaiting: Vec<bool>,
    /// Where the next scan starts, so no source is favoured.
    cursor: usize,
    send_slots: Vec<Option<SendSlot<T>>>,
    send_scratch: Vec<Vec<u8>>,
    stats: EngineStats,
}

impl<I: Interconnect, T: Transposable> RedistributionEngine<I, T> {
    pub fn new(group: RedistributionGroup, interconnect: I) -> Self {
        Self::with_tag_base(group, interconnect, DEFAULT_TAG_BASE)
    }

    pub fn with_tag_base(group: RedistributionGroup, interconnect: I, tag_base: u32) -> Self {
        let sources = group.num_sources();
        let destinations = group.num_destinations();
        tracing::debug!(
            rank = group.local_rank(),
            sources,
            destinations,
            role = ?group.role(),
            "redistribution engine ready"
        );
        Self {
            recv_handles: vec![vec![None; T::PARTS]; sources],
            recv_parts: vec![vec![Vec::new(); T::PARTS]; sources],
            awaiting: vec![false; sources],
            cursor: 0,
            send_slots: (0..destinations).map(|_| None).collect(),
            send_scratch: vec![Vec::new(); T::PARTS],
            stats: EngineStats::default(),
            group,
            interconnect,
            tag_base,
        }
    }

    pub fn group(&self) -> &RedistributionGroup {
        &self.group
    }

    pub fn role(&self) -> Role {
        self.group.role()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn interconnect(&self) -> &I {
        &self.interconnect
    }

    pub fn into_interconnect(self) -> I {
        self.interconnect
    }

    /// Sources that still owe a unit this round.
    pub fn outstanding_receives(&self) -> usize {
        self.awaiting.iter().filter(|&&a| a).count()
    }

    /// Destinations whose send has not completed.
    pub fn outstanding_sends(&self) -> usize {
        self.send_slots
            .iter()
            .filter(|slot| slot.as_ref().is_some_and(|s| !s.done()))
            .count()
    }

    /// Post one receive per source per part for the next round.
    ///
    /// Sources still owing a unit from the previous round keep their
    /// handles.
    pub fn post_receives(&mut self) -> FlowResult<()> {
        self.stats.rounds += 1;
        for (index, &rank) in self.group.sources().iter().enumerate() {
            if self.awaiting[index] {
                continue;
            }
            for part in 0..T::PARTS {
                let request = self.interconnect.irecv(rank, self.tag_base + part as u32)?;
                self.recv_handles[index][part] = Some(request);
            }
            self.awaiting[index] = true;
        }
        Ok(())
    }

    /// Test every open handle once. Returns a source whose unit is complete.
    fn sweep_receives(&mut self, slots: &mut [T]) -> FlowResult<Option<usize>> {
        let sources = self.awaiting.len();
        for step in 0..sources {
            let index = (self.cursor + step) % sources;
            if !self.awaiting[index] {
                continue;
            }
            for part in 0..T::PARTS {
                let Some(request) = self.recv_handles[index][part] else {
                    continue;
                };
                match self.interconnect.test_recv(&request, &mut self.recv_parts[index][part]) {
                    Ok(true) => self.recv_handles[index][part] = None,
                    Ok(false) => {}
                    Err(err) => {
                        // Abandon the whole unit; no retry.
                        self.recv_handles[index].iter_mut().for_each(|h| *h = None);
                        self.awaiting[index] = false;
                        self.stats.failures += 1;
                        tracing::warn!(source = request.peer, error = %err, "receive failed");
                        return Err(err);
                    }
                }
            }
            if self.recv_handles[index].iter().all(Option::is_none) {
                self.awaiting[index] = false;
                self.cursor = (index + 1) % sources;
                if let Err(err) = slots[index].assemble_parts(&self.recv_parts[index]) {
                    let source = self.group.sources()[index];
                    self.stats.failures += 1;
                    tracing::warn!(source, error = %err, "malformed unit");
                    return Err(tag_rank(err, source));
                }
                self.stats.received += 1;
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn check_slots(&self, slots: &[T]) -> FlowResult<()> {
        if slots.len() != self.group.num_sources() {
            return Err(FlowError::layout(format!(
                "{} receive slots for {} sources",
                slots.len(),
                self.group.num_sources()
            )));
        }
        Ok(())
    }

    /// Block until one source's unit has fully arrived, assemble it into
    /// `slots[index]` and return that source index. `None` once no receive
    /// is outstanding.
    pub fn wait_for_any(&mut self, slots: &mut [T]) -> FlowResult<Option<usize>> {
        self.wait_until(slots, None)
    }

    /// Like [`wait_for_any`](Self::wait_for_any) but gives up after
    /// `timeout`, returning `None`.
    pub fn wait_for_any_timeout(&mut self, slots: &mut [T], timeout: Duration) -> FlowResult<Option<usize>> {
        self.wait_until(slots, Some(Instant::now() + timeout))
    }

    fn wait_until(&mut self, slots: &mut [T], deadline: Option<Instant>) -> FlowResult<Option<usize>> {
        self.check_slots(slots)?;
        loop {
            if self.outstanding_receives() == 0 {
                return Ok(None);
            }
            if let Some(index) = self.sweep_receives(slots)? {
                return Ok(Some(index));
            }
            let slice = match deadline {
                None => PROGRESS_SLICE,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(PROGRESS_SLICE)
                }
            };
            self.interconnect.wait_progress(slice)?;
        }
    }

    /// Whether a new unit may be sent to `dest` (a rank).
    pub fn can_send(&self, dest: usize) -> bool {
        self.group
            .destination_index(dest)
            .is_some_and(|index| self.send_slots[index].is_none())
    }

    /// Start sending `unit` to rank `dest`. The engine owns the unit until
    /// [`wait_for_all_sends`](Self::wait_for_all_sends) hands it back.
    pub fn async_send(&mut self, dest: usize, unit: T) -> FlowResult<()> {
        let index = self
            .group
            .destination_index(dest)
            .ok_or_else(|| FlowError::Config(format!("rank {dest} is not a destination")))?;
        if self.send_slots[index].is_some() {
            return Err(FlowError::InFlight(format!("unit for rank {dest} not yet collected")));
        }

        unit.split_parts(&mut self.send_scratch)?;
        let mut handles = Vec::with_capacity(T::PARTS);
        for (part, data) in self.send_scratch.iter().enumerate() {
            match self.interconnect.isend(dest, self.tag_base + part as u32, data) {
                Ok(request) => handles.push(Some(request)),
                Err(err) => {
                    self.stats.failures += 1;
                    tracing::warn!(dest, error = %err, "send failed");
                    return Err(err);
                }
            }
        }
        self.send_slots[index] = Some(SendSlot { unit, handles });
        Ok(())
    }

    /// Test the send to `dest` once. `true` when it has completed.
    pub fn poll_send(&mut self, dest: usize) -> FlowResult<bool> {
        let index = self
            .group
            .destination_index(dest)
            .ok_or_else(|| FlowError::Config(format!("rank {dest} is not a destination")))?;
        self.poll_slot(index)
    }

    fn poll_slot(&mut self, index: usize) -> FlowResult<bool> {
        let Some(slot) = self.send_slots[index].as_mut() else {
            return Ok(true);
        };
        let mut failure = None;
        for handle in slot.handles.iter_mut() {
            let Some(request) = handle else {
                continue;
            };
            match self.interconnect.test_send(request) {
                Ok(true) => *handle = None,
                Ok(false) => {}
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let done = slot.done();

        if let Some(err) = failure {
            // The unit is dropped with its slot; no retry.
            self.send_slots[index] = None;
            self.stats.failures += 1;
            tracing::warn!(error = %err, "send failed");
            return Err(err);
        }
        Ok(done)
    }

    /// Wait until every posted send has completed and hand the units back,
    /// paired with their destination rank.
    pub fn wait_for_all_sends(&mut self) -> FlowResult<Vec<(usize, T)>> {
        loop {
            let mut pending = false;
            for index in 0..self.send_slots.len() {
                if !self.poll_slot(index)? {
                    pending = true;
                }
            }
            if !pending {
                break;
            }
            self.interconnect.wait_progress(PROGRESS_SLICE)?;
        }

        let mut units = Vec::with_capacity(self.send_slots.len());
        for (index, slot) in self.send_slots.iter_mut().enumerate() {
            if let Some(slot) = slot.take() {
                self.stats.sent += 1;
                units.push((self.group.destinations()[index], slot.unit));
            }
        }
        Ok(units)
    }
}
