//! In-process cluster interconnect.
//!
//! A [`Fabric`] connects a fixed set of ranks. Every rank owns a mailbox of
//! frames keyed by `(source, tag)`; sends are eager (the frame is copied into
//! the destination mailbox immediately), receives match on source and tag in
//! FIFO order. A rank that leaves or is failed makes every later exchange
//! with it a transport error naming that rank. Closing a channel closes its
//! route in both directions; the peer drains what was delivered and then
//! sees `Closed`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Channel, ChannelKind, State};
use crate::error::{FlowError, FlowResult, Peer, TransportFault};

#[derive(Default)]
struct MailboxState {
    queues: HashMap<(usize, u32), VecDeque<Vec<u8>>>,
    /// Spent frame vectors, reused by later deliveries.
    spare: Vec<Vec<u8>>,
    /// `(source, tag)` routes into this mailbox that were closed.
    closed: HashSet<(usize, u32)>,
    /// Bumped on every delivery or membership change.
    generation: u64,
}

struct Mailbox {
    state: Mutex<MailboxState>,
    arrived: Condvar,
}

pub struct Fabric {
    mailboxes: Vec<Mailbox>,
    alive: Vec<AtomicBool>,
}

impl Fabric {
    pub fn new(ranks: usize) -> Arc<Self> {
        let mailboxes = (0..ranks)
            .map(|_| Mailbox {
                state: Mutex::new(MailboxState::default()),
                arrived: Condvar::new(),
            })
            .collect();
        let alive = (0..ranks).map(|_| AtomicBool::new(true)).collect();
        Arc::new(Self { mailboxes, alive })
    }

    pub fn size(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_alive(&self, rank: usize) -> bool {
        self.alive
            .get(rank)
            .map(|a| a.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Handle for `rank`.
    pub fn endpoint(self: &Arc<Self>, rank: usize) -> FlowResult<ClusterEndpoint> {
        if rank >= self.size() {
            return Err(FlowError::Config(format!(
                "rank {rank} outside fabric of {} ranks",
                self.size()
            )));
        }
        Ok(ClusterEndpoint::new(self.clone(), rank))
    }

    /// Mark `rank` as gone and wake every waiter so it notices.
    pub fn fail(&self, rank: usize) {
        if let Some(flag) = self.alive.get(rank) {
            if flag.swap(false, Ordering::AcqRel) {
                tracing::warn!(rank, "cluster rank left the fabric");
            }
        }
        for mailbox in &self.mailboxes {
            mailbox.state.lock().generation += 1;
            mailbox.arrived.notify_all();
        }
    }

    fn check_peer(&self, peer: usize) -> FlowResult<()> {
        if peer >= self.size() {
            return Err(FlowError::transport(
                peer,
                TransportFault::Unreachable,
                "rank outside fabric",
            ));
        }
        if !self.is_alive(peer) {
            return Err(FlowError::transport(peer, TransportFault::Reset, "rank left the fabric"));
        }
        Ok(())
    }

    /// Eagerly deliver a copy of `data` from `src` to `dest`.
    pub fn post(&self, src: usize, dest: usize, tag: u32, data: &[u8]) -> FlowResult<()> {
        self.check_peer(dest)?;
        let mailbox = &self.mailboxes[dest];
        let mut state = mailbox.state.lock();
        if state.closed.contains(&(src, tag)) {
            return Err(FlowError::transport(dest, TransportFault::Closed, format!("route on tag {tag} closed")));
        }
        let mut frame = state.spare.pop().unwrap_or_default();
        frame.clear();
        frame.extend_from_slice(data);
        state.queues.entry((src, tag)).or_default().push_back(frame);
        state.generation += 1;
        drop(state);
        mailbox.arrived.notify_all();
        Ok(())
    }

    /// Take the oldest frame from `src` with `tag` addressed to `dest`.
    ///
    /// `Ok(false)` when nothing has arrived yet; an error when nothing has
    /// arrived and `src` is gone.
    pub fn take(&self, dest: usize, src: usize, tag: u32, out: &mut Vec<u8>) -> FlowResult<bool> {
        let mut state = self.mailboxes[dest].state.lock();
        if let Some(mut frame) = state.queues.get_mut(&(src, tag)).and_then(VecDeque::pop_front) {
            std::mem::swap(out, &mut frame);
            frame.clear();
            state.spare.push(frame);
            return Ok(true);
        }
        let closed = state.closed.contains(&(src, tag));
        drop(state);
        self.check_peer(src)?;
        if closed {
            return Err(FlowError::transport(src, TransportFault::Closed, format!("route on tag {tag} closed")));
        }
        Ok(false)
    }

    /// Close the `a <-> b` route on `tag` in both directions and wake both
    /// ranks. Closed routes stay closed for the lifetime of the fabric.
    pub fn close_route(&self, a: usize, b: usize, tag: u32) {
        for (src, dest) in [(a, b), (b, a)] {
            let Some(mailbox) = self.mailboxes.get(dest) else {
                continue;
            };
            let mut state = mailbox.state.lock();
            state.closed.insert((src, tag));
            state.generation += 1;
            drop(state);
            mailbox.arrived.notify_all();
        }
    }

    /// Current delivery generation of `rank`'s mailbox.
    pub fn generation(&self, rank: usize) -> u64 {
        self.mailboxes[rank].state.lock().generation
    }

    /// Block until `rank`'s mailbox generation moves past `seen` or the
    /// timeout expires. Returns the generation observed last.
    pub fn wait(&self, rank: usize, seen: u64, timeout: Duration) -> u64 {
        let mailbox = &self.mailboxes[rank];
        let deadline = Instant::now() + timeout;
        let mut state = mailbox.state.lock();
        while state.generation == seen {
            if mailbox.arrived.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.generation
    }
}

/// One rank's view of a [`Fabric`].
pub struct ClusterEndpoint {
    fabric: Arc<Fabric>,
    rank: usize,
}

impl ClusterEndpoint {
    fn new(fabric: Arc<Fabric>, rank: usize) -> Self {
        Self { fabric, rank }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.fabric.size()
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn send(&self, dest: usize, tag: u32, data: &[u8]) -> FlowResult<()> {
        self.fabric.post(self.rank, dest, tag, data)
    }

    pub fn try_recv(&self, src: usize, tag: u32, out: &mut Vec<u8>) -> FlowResult<bool> {
        self.fabric.take(self.rank, src, tag, out)
    }

    /// Receive one frame, waiting at most `timeout`.
    pub fn recv_timeout(&self, src: usize, tag: u32, out: &mut Vec<u8>, timeout: Duration) -> FlowResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.fabric.generation(self.rank);
            if self.try_recv(src, tag, out)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.fabric.wait(self.rank, seen, deadline - now);
        }
    }

    /// A point-to-point channel to `peer` on `tag`.
    pub fn channel(&self, peer: usize, tag: u32, blocking: bool) -> ClusterChannel {
        ClusterChannel {
            fabric: self.fabric.clone(),
            local: self.rank,
            remote: peer,
            tag,
            peer: Peer::Rank(peer),
            blocking,
            closed: false,
            error: None,
        }
    }

    /// Leave the fabric; peers see this rank as gone.
    pub fn leave(&self) {
        self.fabric.fail(self.rank);
    }
}

/// Point-to-point view (peer rank + tag) onto a fabric.
pub struct ClusterChannel {
    fabric: Arc<Fabric>,
    local: usize,
    remote: usize,
    tag: u32,
    peer: Peer,
    blocking: bool,
    closed: bool,
    error: Option<FlowError>,
}

impl ClusterChannel {
    fn fail(&mut self, err: FlowError) -> State {
        self.error = Some(err);
        State::Error
    }

    fn receive_until(&mut self, frame: &mut Vec<u8>, deadline: Option<Instant>) -> State {
        loop {
            let seen = self.fabric.generation(self.local);
            match self.fabric.take(self.local, self.remote, self.tag, frame) {
                Ok(true) => return State::Finished,
                Ok(false) => {}
                Err(e) => return self.fail(e),
            }
            let wait = match deadline {
                None => Duration::from_millis(100),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return State::WouldBlock;
                    }
                    deadline - now
                }
            };
            self.fabric.wait(self.local, seen, wait);
        }
    }
}

impl Channel for ClusterChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Cluster
    }

    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn send(&mut self, frame: &[u8]) -> State {
        if self.closed {
            return self.fail(FlowError::transport(self.remote, TransportFault::Closed, "channel closed"));
        }
        match self.fabric.post(self.local, self.remote, self.tag, frame) {
            Ok(()) => State::Finished,
            Err(e) => self.fail(e),
        }
    }

    fn receive(&mut self, frame: &mut Vec<u8>) -> State {
        if self.closed {
            return self.fail(FlowError::transport(self.remote, TransportFault::Closed, "channel closed"));
        }
        if self.blocking {
            return self.receive_until(frame, None);
        }
        match self.fabric.take(self.local, self.remote, self.tag, frame) {
            Ok(true) => State::Finished,
            Ok(false) => State::WouldBlock,
            Err(e) => self.fail(e),
        }
    }

    fn poll_receive(&mut self, frame: &mut Vec<u8>, timeout: Duration) -> State {
        if self.closed {
            return self.fail(FlowError::transport(self.remote, TransportFault::Closed, "channel closed"));
        }
        self.receive_until(frame, Some(Instant::now() + timeout))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.fabric.close_route(self.local, self.remote, self.tag);
        }
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn take_error(&mut self) -> Option<FlowError> {
        self.error.take()
    }
}
