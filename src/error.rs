//! Error taxonomy for the transport framework.
//!
//! Every fallible operation in the crate returns [`FlowResult`]. The variants
//! follow how a failure must be handled by the owning stage:
//!
//! - [`FlowError::Layout`] and [`FlowError::InFlight`] are programmer errors.
//! - [`FlowError::Transport`] is recoverable by tearing down and recreating the link.
//! - [`FlowError::Overload`] is a dropped unit: counted, reported, never fatal.
//! - [`FlowError::ProtocolMismatch`] aborts the offending exchange only.
//! - [`FlowError::MissingData`] is only raised under [`MissingDataPolicy::Fatal`].
//! - [`FlowError::StagePanicked`] ends the panicking stage only.
//!
//! [`MissingDataPolicy::Fatal`]: crate::config::MissingDataPolicy::Fatal

use std::fmt;
use std::io;
use thiserror::Error;

/// Identifies the remote end of a failed transport operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    /// A rank inside a cluster fabric or redistribution group.
    Rank(usize),
    /// A named endpoint (socket address, shared-memory band, memory link).
    Named(String),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Rank(rank) => write!(f, "rank {rank}"),
            Peer::Named(name) => f.write_str(name),
        }
    }
}

impl From<usize> for Peer {
    fn from(rank: usize) -> Self {
        Peer::Rank(rank)
    }
}

impl From<&str> for Peer {
    fn from(name: &str) -> Self {
        Peer::Named(name.to_string())
    }
}

impl From<String> for Peer {
    fn from(name: String) -> Self {
        Peer::Named(name)
    }
}

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    /// The peer could not be reached at connect time.
    Unreachable,
    /// The connection was reset or the peer vanished mid-exchange.
    Reset,
    /// The channel or link was closed locally or by the peer.
    Closed,
    /// Bytes arrived that do not form a valid frame.
    Malformed,
    /// Any other operating-system level I/O failure.
    Io,
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransportFault::Unreachable => "unreachable",
            TransportFault::Reset => "connection reset",
            TransportFault::Closed => "closed",
            TransportFault::Malformed => "malformed data",
            TransportFault::Io => "i/o failure",
        };
        f.write_str(text)
    }
}

/// Main error type for the framework.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// Buffer shape misuse.
    #[error("Layout error: {0}")]
    Layout(String),

    /// Peer unreachable, connection reset, malformed wire data.
    #[error("Transport error ({kind}) with {peer}: {message}")]
    Transport {
        peer: Peer,
        kind: TransportFault,
        message: String,
    },

    /// A bound was exceeded and one unit was dropped.
    #[error("Overload in {site}: {detail}")]
    Overload { site: String, detail: String },

    /// Version tag on the wire does not match the local buffer type.
    #[error("Protocol mismatch: expected version tag {expected:#018x}, found {found:#018x}")]
    ProtocolMismatch { expected: u64, found: u64 },

    /// Data for a wall-clock gated window never arrived.
    #[error("Missing data for window [{begin}, {end})")]
    MissingData { begin: i64, end: i64 },

    /// A buffer handed to an async send was reused before completion.
    #[error("Buffer still in flight: {0}")]
    InFlight(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stage's thread panicked; the payload is the stage name.
    #[error("Stage '{0}' panicked")]
    StagePanicked(String),
}

impl FlowError {
    pub fn layout(message: impl Into<String>) -> Self {
        FlowError::Layout(message.into())
    }

    pub fn transport(peer: impl Into<Peer>, kind: TransportFault, message: impl Into<String>) -> Self {
        FlowError::Transport {
            peer: peer.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn overload(site: impl Into<String>, detail: impl Into<String>) -> Self {
        FlowError::Overload {
            site: site.into(),
            detail: detail.into(),
        }
    }

    /// Wraps an I/O error as a transport failure against `peer`.
    pub fn io(peer: impl Into<Peer>, err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotFound
            | io::ErrorKind::AddrNotAvailable => TransportFault::Unreachable,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportFault::Reset,
            io::ErrorKind::InvalidData => TransportFault::Malformed,
            _ => TransportFault::Io,
        };
        FlowError::transport(peer, kind, err.to_string())
    }

    /// Whether the error must abort the exchange or stage rather than be
    /// absorbed as a dropped unit.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FlowError::Overload { .. })
    }

    /// Whether the error is an overload/drop event.
    pub fn is_overload(&self) -> bool {
        matches!(self, FlowError::Overload { .. })
    }

    /// The peer a transport failure is attributed to, if any.
    pub fn peer(&self) -> Option<&Peer> {
        match self {
            FlowError::Transport { peer, .. } => Some(peer),
            _ => None,
        }
    }
}

pub type FlowResult<T> = std::result::Result<T, FlowError>;
