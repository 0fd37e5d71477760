// In-process channel pair over bounded crossbeam queues.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

use super::{Channel, ChannelKind, State};
use crate::error::{FlowError, Peer, TransportFault};

/// One end of a connected in-process pair.
///
/// Frame vectors travel back to the sending side after use, so a pair in
/// steady state stops allocating once every queued vector has grown to the
/// frame size.
pub struct MemoryChannel {
    peer: Peer,
    tx: Option<Sender<Vec<u8>>>,
    rx: Option<Receiver<Vec<u8>>>,
    /// Spent vectors handed back to the peer's sender.
    recycle_tx: Option<Sender<Vec<u8>>>,
    /// Spent vectors the peer handed back to us.
    pool_rx: Receiver<Vec<u8>>,
    /// A frame already copied but not yet accepted by a full queue.
    pending: Option<Vec<u8>>,
    blocking: bool,
    error: Option<FlowError>,
}

/// Create a connected pair whose queues hold at most `capacity` frames in
/// each direction.
pub fn pair(name: &str, capacity: usize, blocking: bool) -> (MemoryChannel, MemoryChannel) {
    let capacity = capacity.max(1);
    let (a_tx, b_rx) = bounded(capacity);
    let (b_tx, a_rx) = bounded(capacity);
    // Pools are sized so handing a vector back never blocks.
    let (a_recycle, b_pool) = bounded(capacity + 1);
    let (b_recycle, a_pool) = bounded(capacity + 1);

    let a = MemoryChannel {
        peer: Peer::Named(format!("{name}/b")),
        tx: Some(a_tx),
        rx: Some(a_rx),
        recycle_tx: Some(a_recycle),
        pool_rx: a_pool,
        pending: None,
        blocking,
        error: None,
    };
    let b = MemoryChannel {
        peer: Peer::Named(format!("{name}/a")),
        tx: Some(b_tx),
        rx: Some(b_rx),
        recycle_tx: Some(b_recycle),
        pool_rx: b_pool,
        pending: None,
        blocking,
        error: None,
    };
    (a, b)
}

impl MemoryChannel {
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    fn fail(&mut self, kind: TransportFault, message: &str) -> State {
        self.error = Some(FlowError::transport(self.peer.clone(), kind, message));
        State::Error
    }

    fn deliver(&mut self, mut incoming: Vec<u8>, frame: &mut Vec<u8>) -> State {
        std::mem::swap(frame, &mut incoming);
        incoming.clear();
        if let Some(recycle) = &self.recycle_tx {
            let _ = recycle.try_send(incoming);
        }
        State::Finished
    }
}

impl Channel for MemoryChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Memory
    }

    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn send(&mut self, frame: &[u8]) -> State {
        let Some(tx) = self.tx.clone() else {
            return self.fail(TransportFault::Closed, "send on closed channel");
        };

        let outgoing = match self.pending.take() {
            // Resuming: the frame was copied on the first attempt.
            Some(pending) => pending,
            None => {
                let mut buf = self.pool_rx.try_recv().unwrap_or_default();
                buf.clear();
                buf.extend_from_slice(frame);
                buf
            }
        };

        if self.blocking {
            return match tx.send(outgoing) {
                Ok(()) => State::Finished,
                Err(_) => self.fail(TransportFault::Reset, "peer dropped its end"),
            };
        }
        match tx.try_send(outgoing) {
            Ok(()) => State::Finished,
            Err(TrySendError::Full(back)) => {
                self.pending = Some(back);
                State::WouldBlock
            }
            Err(TrySendError::Disconnected(_)) => self.fail(TransportFault::Reset, "peer dropped its end"),
        }
    }

    fn receive(&mut self, frame: &mut Vec<u8>) -> State {
        let Some(rx) = self.rx.clone() else {
            return self.fail(TransportFault::Closed, "receive on closed channel");
        };
        if self.blocking {
            return match rx.recv() {
                Ok(incoming) => self.deliver(incoming, frame),
                Err(_) => self.fail(TransportFault::Closed, "peer closed"),
            };
        }
        match rx.try_recv() {
            Ok(incoming) => self.deliver(incoming, frame),
            Err(TryRecvError::Empty) => State::WouldBlock,
            Err(TryRecvError::Disconnected) => self.fail(TransportFault::Closed, "peer closed"),
        }
    }

    fn poll_receive(&mut self, frame: &mut Vec<u8>, timeout: Duration) -> State {
        let Some(rx) = self.rx.clone() else {
            return self.fail(TransportFault::Closed, "receive on closed channel");
        };
        match rx.recv_timeout(timeout) {
            Ok(incoming) => self.deliver(incoming, frame),
            Err(RecvTimeoutError::Timeout) => State::WouldBlock,
            Err(RecvTimeoutError::Disconnected) => self.fail(TransportFault::Closed, "peer closed"),
        }
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx = None;
        self.recycle_tx = None;
        self.pending = None;
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn supports_async(&self) -> bool {
        true
    }

    fn take_error(&mut self) -> Option<FlowError> {
        self.error.take()
    }
}

/// Rendezvous point for in-process links: the first caller for a name
/// creates the pair and keeps one end, the second caller takes it.
pub struct MemoryRendezvous {
    waiting: Mutex<HashMap<String, MemoryChannel>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self {
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub fn endpoint(&self, name: &str, capacity: usize, blocking: bool) -> MemoryChannel {
        let mut waiting = self.waiting.lock();
        if let Some(mut end) = waiting.remove(name) {
            end.set_blocking(blocking);
            return end;
        }
        let (mine, theirs) = pair(name, capacity, blocking);
        waiting.insert(name.to_string(), theirs);
        mine
    }

    /// Names whose second end has not been claimed yet.
    pub fn unclaimed(&self) -> Vec<String> {
        self.waiting.lock().keys().cloned().collect()
    }
}

impl Default for MemoryRendezvous {
    fn default() -> Self {
        Self::new()
    }
}
