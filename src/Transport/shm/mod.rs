//! Shared-memory channel over bands of one segment.
//!
//! Each direction is one band: a sequence-numbered slot ring inside a named
//! `/dev/shm` segment. Frames larger than a slot are split across
//! consecutive slots flagged [`FRAG_MORE`]; a band therefore carries frames
//! from one sender to one reader.

pub mod layout;
pub mod ring;

use std::sync::Arc;
use std::time::{Duration, Instant};

use self::layout::FRAG_MORE;
use super::{Channel, ChannelKind, State};
use crate::error::{FlowError, Peer, TransportFault};
use crate::Core::alloc::{BandPartition, SegmentAllocator};

/// Wake-up granularity of blocking waits, so closes are noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(20);

pub struct ShmChannel {
    segment: Arc<SegmentAllocator>,
    tx: Option<BandPartition>,
    rx: Option<BandPartition>,
    peer: Peer,
    blocking: bool,
    /// Bytes of the current outgoing frame already published.
    tx_offset: usize,
    /// Whether the first fragment of the current outgoing frame went out.
    tx_started: bool,
    rx_frame: Vec<u8>,
    error: Option<FlowError>,
}

impl ShmChannel {
    /// Open a channel sending on `tx_band` and receiving on `rx_band` of an
    /// existing segment. Either band may be absent for a one-way channel.
    pub fn open(
        segment: Arc<SegmentAllocator>,
        tx_band: Option<u32>,
        rx_band: Option<u32>,
        blocking: bool,
    ) -> Result<Self, FlowError> {
        let peer = Peer::Named(format!(
            "shm:{}[tx={:?},rx={:?}]",
            segment.segment_name(),
            tx_band,
            rx_band
        ));
        let lookup = |band: Option<u32>| -> Result<Option<BandPartition>, FlowError> {
            match band {
                None => Ok(None),
                Some(id) => segment.get_band(id).map(Some).ok_or_else(|| {
                    FlowError::transport(
                        peer.clone(),
                        TransportFault::Unreachable,
                        format!("band {id} does not exist"),
                    )
                }),
            }
        };
        let tx = lookup(tx_band)?;
        let rx = lookup(rx_band)?;

        Ok(Self {
            segment,
            tx,
            rx,
            peer,
            blocking,
            tx_offset: 0,
            tx_started: false,
            rx_frame: Vec::new(),
            error: None,
        })
    }

    pub fn sender(segment: Arc<SegmentAllocator>, band: u32, blocking: bool) -> Result<Self, FlowError> {
        Self::open(segment, Some(band), None, blocking)
    }

    pub fn receiver(segment: Arc<SegmentAllocator>, band: u32, blocking: bool) -> Result<Self, FlowError> {
        Self::open(segment, None, Some(band), blocking)
    }

    /// Create two bands and return both ends of a duplex channel.
    pub fn pair(
        segment: Arc<SegmentAllocator>,
        capacity: usize,
        slot_bytes: usize,
        blocking: bool,
    ) -> Result<(Self, Self), FlowError> {
        let name = segment.segment_name().to_string();
        let create = |segment: &SegmentAllocator| {
            segment
                .create_band(capacity, slot_bytes)
                .map(|band| band.id())
                .map_err(|e| FlowError::io(format!("shm:{name}"), &e))
        };
        let forward = create(&*segment)?;
        let backward = create(&*segment)?;
        let a = Self::open(segment.clone(), Some(forward), Some(backward), blocking)?;
        let b = Self::open(segment, Some(backward), Some(forward), blocking)?;
        Ok((a, b))
    }

    pub fn segment(&self) -> &Arc<SegmentAllocator> {
        &self.segment
    }

    fn fail(&mut self, kind: TransportFault, message: impl Into<String>) -> State {
        self.error = Some(FlowError::transport(self.peer.clone(), kind, message));
        State::Error
    }

    /// Publish as many fragments as fit. `Ok(true)` once the frame is out.
    fn push_fragments(&mut self, frame: &[u8]) -> Result<bool, TransportFault> {
        let Some(band) = &self.tx else {
            return Err(TransportFault::Closed);
        };
        let ring = band.ring();
        let slot = ring.slot_bytes();
        loop {
            if ring.is_closed() {
                return Err(TransportFault::Closed);
            }
            if self.tx_started && self.tx_offset >= frame.len() {
                return Ok(true);
            }
            let end = (self.tx_offset + slot).min(frame.len());
            let flags = if end < frame.len() { FRAG_MORE } else { 0 };
            match ring.enqueue(&frame[self.tx_offset..end], flags) {
                Some(_) => {
                    self.tx_offset = end;
                    self.tx_started = true;
                    ring.signal_consumer();
                }
                None => return Ok(false),
            }
        }
    }

    /// Drain fragments into `rx_frame`. `Ok(true)` once a frame is complete.
    fn pull_fragments(&mut self) -> Result<bool, TransportFault> {
        let Some(band) = &self.rx else {
            return Err(TransportFault::Closed);
        };
        let ring = band.ring();
        loop {
            match ring.dequeue_into(&mut self.rx_frame) {
                Some(flags) => {
                    ring.signal_producer();
                    if flags & FRAG_MORE == 0 {
                        return Ok(true);
                    }
                }
                None if ring.is_closed() => return Err(TransportFault::Closed),
                None => return Ok(false),
            }
        }
    }

    fn finish_receive(&mut self, frame: &mut Vec<u8>) -> State {
        frame.clear();
        std::mem::swap(frame, &mut self.rx_frame);
        State::Finished
    }

    fn receive_until(&mut self, frame: &mut Vec<u8>, deadline: Option<Instant>) -> State {
        loop {
            match self.pull_fragments() {
                Ok(true) => return self.finish_receive(frame),
                Ok(false) => {}
                Err(kind) => return self.fail(kind, "band closed by peer"),
            }
            let wait = match deadline {
                None => WAIT_SLICE,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return State::WouldBlock;
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
            };
            if let Some(band) = &self.rx {
                band.ring().wait_for_data(wait);
            }
        }
    }
}

impl Channel for ShmChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::SharedMemory
    }

    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn send(&mut self, frame: &[u8]) -> State {
        loop {
            match self.push_fragments(frame) {
                Ok(true) => {
                    self.tx_offset = 0;
                    self.tx_started = false;
                    return State::Finished;
                }
                Ok(false) if !self.blocking => return State::WouldBlock,
                Ok(false) => {
                    if let Some(band) = &self.tx {
                        band.ring().wait_for_space(WAIT_SLICE);
                    }
                }
                Err(kind) => {
                    self.tx_offset = 0;
                    self.tx_started = false;
                    return self.fail(kind, "band closed");
                }
            }
        }
    }

    fn receive(&mut self, frame: &mut Vec<u8>) -> State {
        if self.blocking {
            return self.receive_until(frame, None);
        }
        match self.pull_fragments() {
            Ok(true) => self.finish_receive(frame),
            Ok(false) => State::WouldBlock,
            Err(kind) => self.fail(kind, "band closed by peer"),
        }
    }

    fn poll_receive(&mut self, frame: &mut Vec<u8>, timeout: Duration) -> State {
        self.receive_until(frame, Some(Instant::now() + timeout))
    }

    fn close(&mut self) {
        if let Some(band) = self.tx.take() {
            band.ring().mark_closed();
        }
        if let Some(band) = self.rx.take() {
            band.ring().mark_closed();
        }
        tracing::debug!(peer = %self.peer, "shm channel closed");
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn supports_async(&self) -> bool {
        true
    }

    fn can_send(&self) -> bool {
        self.tx.is_some()
    }

    fn can_receive(&self) -> bool {
        self.rx.is_some()
    }

    fn take_error(&mut self) -> Option<FlowError> {
        self.error.take()
    }
}
