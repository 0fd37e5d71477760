//! Point-to-point frame transports.
//!
//! A [`Channel`] moves opaque byte frames to exactly one peer. Every backend
//! offers the same blocking and non-blocking primitives, so links and stages
//! never depend on which one they were given.

use std::fmt;
use std::time::Duration;

use crate::error::{FlowError, Peer};

pub mod adapter;
pub mod cluster;
pub mod memory;
pub mod shm;
pub mod socket;

pub use adapter::AsyncAdapter;
pub use cluster::{ClusterChannel, ClusterEndpoint, Fabric};
pub use memory::{MemoryChannel, MemoryRendezvous};
pub use shm::ShmChannel;
pub use socket::{SocketChannel, SocketListener};

/// Outcome of one send or receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The whole frame was transferred.
    Finished,
    /// No (further) progress is possible right now; call again later.
    WouldBlock,
    /// The channel failed; [`Channel::take_error`] returns the cause.
    Error,
}

/// Backend family of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Memory,
    SharedMemory,
    Socket,
    Cluster,
    /// A blocking backend behind an [`AsyncAdapter`].
    Adapted,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Memory => "memory",
            ChannelKind::SharedMemory => "shm",
            ChannelKind::Socket => "socket",
            ChannelKind::Cluster => "cluster",
            ChannelKind::Adapted => "adapted",
        };
        f.write_str(name)
    }
}

/// An abstract transport backend moving byte frames between two endpoints.
///
/// Frames are delivered whole and in order. When `send` returns
/// [`State::WouldBlock`] part of the frame may already be on its way; the
/// caller must pass the same frame again and the transfer resumes where it
/// stopped. `receive` clears `frame` and fills it only on
/// [`State::Finished`].
///
/// Blocking channels never return `WouldBlock` from `send` or `receive`.
pub trait Channel: Send {
    fn kind(&self) -> ChannelKind;

    /// The remote endpoint, used to tag errors.
    fn peer(&self) -> &Peer;

    /// Establish the connection. Idempotent.
    fn connect(&mut self) -> Result<(), FlowError> {
        Ok(())
    }

    /// Complete any handshake after `connect`. Idempotent.
    fn init(&mut self) -> Result<(), FlowError> {
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> State;

    fn receive(&mut self, frame: &mut Vec<u8>) -> State;

    /// Receive, waiting at most `timeout` for a frame to arrive.
    /// Returns `WouldBlock` on timeout regardless of the blocking mode.
    fn poll_receive(&mut self, frame: &mut Vec<u8>, timeout: Duration) -> State;

    /// Release the endpoint. The peer observes `Error` once it has drained
    /// what was already delivered.
    fn close(&mut self);

    fn is_blocking(&self) -> bool;

    /// Whether non-blocking progress can be made without a helper thread.
    fn supports_async(&self) -> bool {
        !self.is_blocking()
    }

    fn can_send(&self) -> bool {
        true
    }

    fn can_receive(&self) -> bool {
        true
    }

    /// The error behind the last `State::Error`, if not yet taken.
    fn take_error(&mut self) -> Option<FlowError>;
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn kind(&self) -> ChannelKind {
        (**self).kind()
    }
    fn peer(&self) -> &Peer {
        (**self).peer()
    }
    fn connect(&mut self) -> Result<(), FlowError> {
        (**self).connect()
    }
    fn init(&mut self) -> Result<(), FlowError> {
        (**self).init()
    }
    fn send(&mut self, frame: &[u8]) -> State {
        (**self).send(frame)
    }
    fn receive(&mut self, frame: &mut Vec<u8>) -> State {
        (**self).receive(frame)
    }
    fn poll_receive(&mut self, frame: &mut Vec<u8>, timeout: Duration) -> State {
        (**self).poll_receive(frame, timeout)
    }
    fn close(&mut self) {
        (**self).close()
    }
    fn is_blocking(&self) -> bool {
        (**self).is_blocking()
    }
    fn supports_async(&self) -> bool {
        (**self).supports_async()
    }
    fn can_send(&self) -> bool {
        (**self).can_send()
    }
    fn can_receive(&self) -> bool {
        (**self).can_receive()
    }
    fn take_error(&mut self) -> Option<FlowError> {
        (**self).take_error()
    }
}

/// Wrap `channel` in an [`AsyncAdapter`] unless it already supports
/// non-blocking progress.
pub fn ensure_async(channel: Box<dyn Channel>) -> Box<dyn Channel> {
    if channel.supports_async() {
        channel
    } else {
        Box::new(AsyncAdapter::spawn(channel))
    }
}
