//! Non-blocking point-to-point messaging used by the redistribution engine.

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use crate::error::{FlowError, FlowResult, Peer, TransportFault};
use crate::Transport::{ensure_async, Channel, ClusterEndpoint, State};

/// Handle of one outstanding send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub peer: usize,
    pub tag: u32,
    /// Backend-specific ticket.
    pub ticket: u64,
}

/// A transport able to post sends and receives without waiting for them.
pub trait Interconnect: Send {
    fn rank(&self) -> usize;

    /// Post a send of a copy of `data`.
    fn isend(&mut self, dest: usize, tag: u32, data: &[u8]) -> FlowResult<Request>;

    fn irecv(&mut self, src: usize, tag: u32) -> FlowResult<Request>;

    fn test_send(&mut self, request: &Request) -> FlowResult<bool>;

    /// Poll a receive; on completion its data is swapped into `out`.
    fn test_recv(&mut self, request: &Request, out: &mut Vec<u8>) -> FlowResult<bool>;

    /// Block until progress may have been made or `timeout` passes.
    fn wait_progress(&mut self, timeout: Duration) -> FlowResult<()>;
}

/// Re-attribute a transport error to a rank.
pub(crate) fn tag_rank(err: FlowError, rank: usize) -> FlowError {
    match err {
        FlowError::Transport { kind, message, .. } => FlowError::Transport {
            peer: Peer::Rank(rank),
            kind,
            message,
        },
        other => other,
    }
}

/// Native interconnect over a cluster fabric. Sends are eager and complete
/// as soon as they are posted.
pub struct ClusterInterconnect {
    endpoint: ClusterEndpoint,
    seen: u64,
}

impl ClusterInterconnect {
    pub fn new(endpoint: ClusterEndpoint) -> Self {
        Self { endpoint, seen: 0 }
    }

    pub fn endpoint(&self) -> &ClusterEndpoint {
        &self.endpoint
    }
}

impl From<ClusterEndpoint> for ClusterInterconnect {
    fn from(endpoint: ClusterEndpoint) -> Self {
        Self::new(endpoint)
    }
}

impl Interconnect for ClusterInterconnect {
    fn rank(&self) -> usize {
        self.endpoint.rank()
    }

    fn isend(&mut self, dest: usize, tag: u32, data: &[u8]) -> FlowResult<Request> {
        self.endpoint.send(dest, tag, data)?;
        Ok(Request { peer: dest, tag, ticket: 0 })
    }

    fn irecv(&mut self, src: usize, tag: u32) -> FlowResult<Request> {
        if src >= self.endpoint.size() {
            return Err(FlowError::transport(src, TransportFault::Unreachable, "rank outside fabric"));
        }
        Ok(Request { peer: src, tag, ticket: 0 })
    }

    fn test_send(&mut self, _request: &Request) -> FlowResult<bool> {
        Ok(true)
    }

    fn test_recv(&mut self, request: &Request, out: &mut Vec<u8>) -> FlowResult<bool> {
        self.endpoint.try_recv(request.peer, request.tag, out)
    }

    fn wait_progress(&mut self, timeout: Duration) -> FlowResult<()> {
        self.seen = self.endpoint.fabric().wait(self.endpoint.rank(), self.seen, timeout);
        Ok(())
    }
}

const TAG_PREFIX: usize = 4;

struct PeerChannel {
    channel: Box<dyn Channel>,
    outbox: VecDeque<Vec<u8>>,
    /// Frames handed to `isend` so far.
    queued: u64,
    /// Frames the channel accepted so far.
    sent: u64,
    inbox: Vec<u8>,
    failed: Option<FlowError>,
}

/// Interconnect over one [`Channel`] per peer.
///
/// Frames carry a `u32` tag prefix. Frames that arrive before a matching
/// receive is tested wait in an unexpected-message queue keyed by
/// `(source, tag)`, so per-source FIFO order is kept per tag.
pub struct ChannelInterconnect {
    rank: usize,
    peers: HashMap<usize, PeerChannel>,
    unexpected: HashMap<(usize, u32), VecDeque<Vec<u8>>>,
    spare: Vec<Vec<u8>>,
}

impl ChannelInterconnect {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            peers: HashMap::new(),
            unexpected: HashMap::new(),
            spare: Vec::new(),
        }
    }

    /// Attach the channel to `peer`. Blocking channels are wrapped in an
    /// async adapter.
    pub fn add_peer(&mut self, peer: usize, channel: Box<dyn Channel>) {
        self.peers.insert(
            peer,
            PeerChannel {
                channel: ensure_async(channel),
                outbox: VecDeque::new(),
                queued: 0,
                sent: 0,
                inbox: Vec::new(),
                failed: None,
            },
        );
    }

    pub fn close(&mut self) {
        for peer in self.peers.values_mut() {
            peer.channel.close();
        }
    }

    fn peer_mut(&mut self, rank: usize) -> FlowResult<&mut PeerChannel> {
        self.peers
            .get_mut(&rank)
            .ok_or_else(|| FlowError::transport(rank, TransportFault::Unreachable, "no channel to rank"))
    }

    /// Move frames in both directions on every channel. Returns whether
    /// anything moved.
    fn progress(&mut self) -> bool {
        let mut moved = false;
        for (&rank, peer) in self.peers.iter_mut() {
            if peer.failed.is_some() {
                continue;
            }
            while let Some(frame) = peer.outbox.front() {
                match peer.channel.send(frame) {
                    State::Finished => {
                        moved = true;
                        peer.sent += 1;
                        if let Some(mut spent) = peer.outbox.pop_front() {
                            spent.clear();
                            self.spare.push(spent);
                        }
                    }
                    State::WouldBlock => break,
                    State::Error => {
                        let err = peer.channel.take_error().unwrap_or_else(|| {
                            FlowError::transport(rank, TransportFault::Io, "channel failed")
                        });
                        peer.failed = Some(tag_rank(err, rank));
                        break;
                    }
                }
            }
            if peer.failed.is_some() || !peer.channel.can_receive() {
                continue;
            }
            loop {
                match peer.channel.receive(&mut peer.inbox) {
                    State::Finished => {
                        moved = true;
                        if peer.inbox.len() < TAG_PREFIX {
                            peer.failed = Some(FlowError::transport(
                                rank,
                                TransportFault::Malformed,
                                "frame shorter than its tag",
                            ));
                            break;
                        }
                        let mut tag_bytes = [0u8; TAG_PREFIX];
                        tag_bytes.copy_from_slice(&peer.inbox[..TAG_PREFIX]);
                        let tag = u32::from_le_bytes(tag_bytes);
                        let mut data = self.spare.pop().unwrap_or_default();
                        data.clear();
                        data.extend_from_slice(&peer.inbox[TAG_PREFIX..]);
                        self.unexpected.entry((rank, tag)).or_default().push_back(data);
                    }
                    State::WouldBlock => break,
                    State::Error => {
                        let err = peer.channel.take_error().unwrap_or_else(|| {
                            FlowError::transport(rank, TransportFault::Io, "channel failed")
                        });
                        peer.failed = Some(tag_rank(err, rank));
                        break;
                    }
                }
            }
        }
        moved
    }
}

impl Interconnect for ChannelInterconnect {
    fn rank(&self) -> usize {
        self.rank
    }

    fn isend(&mut self, dest: usize, tag: u32, data: &[u8]) -> FlowResult<Request> {
        let mut frame = self.spare.pop().unwrap_or_default();
        let peer = self.peer_mut(dest)?;
        if let Some(err) = &peer.failed {
            return Err(err.clone());
        }
        frame.clear();
        frame.extend_from_slice(&tag.to_le_bytes());
        frame.extend_from_slice(data);
        peer.outbox.push_back(frame);
        peer.queued += 1;
        let ticket = peer.queued;
        self.progress();
        Ok(Request { peer: dest, tag, ticket })
    }

    fn irecv(&mut self, src: usize, tag: u32) -> FlowResult<Request> {
        self.peer_mut(src)?;
        Ok(Request { peer: src, tag, ticket: 0 })
    }

    fn test_send(&mut self, request: &Request) -> FlowResult<bool> {
        self.progress();
        let peer = self.peer_mut(request.peer)?;
        if peer.sent >= request.ticket {
            return Ok(true);
        }
        match &peer.failed {
            Some(err) => Err(err.clone()),
            None => Ok(false),
        }
    }

    fn test_recv(&mut self, request: &Request, out: &mut Vec<u8>) -> FlowResult<bool> {
        self.progress();
        if let Some(mut data) = self
            .unexpected
            .get_mut(&(request.peer, request.tag))
            .and_then(VecDeque::pop_front)
        {
            std::mem::swap(out, &mut data);
            data.clear();
            self.spare.push(data);
            return Ok(true);
        }
        match &self.peer_mut(request.peer)?.failed {
            Some(err) => Err(err.clone()),
            None => Ok(false),
        }
    }

    fn wait_progress(&mut self, timeout: Duration) -> FlowResult<()> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if self.progress() || Instant::now() >= deadline {
                return Ok(());
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(200));
            } else {
                backoff.snooze();
            }
        }
    }
}
