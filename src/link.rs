//! Links: one producer buffer bound to one consumer buffer over a channel.

use crate::error::{FlowError, FlowResult, TransportFault};
use crate::Buffer::{Serializable, Streamable};
use crate::Transport::{Channel, State};

/// Progress of the current exchange.
///
/// `Idle → Requested → InFlight → {Finished | Error}`; `Finished` returns to
/// `Requested` on the next exchange, `Error` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Requested,
    InFlight,
    Finished,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The local buffer is the producer.
    Write,
    /// The local buffer is the consumer.
    Read,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Completed exchanges.
    pub exchanges: u64,
    /// Units skipped over, judged from gaps in the sequence counter.
    pub lost: u64,
    /// Units whose sequence did not increase.
    pub duplicated: u64,
    /// Calls that returned `WouldBlock`.
    pub stalls: u64,
}

/// A directional binding of a local buffer to a remote one over a channel.
///
/// A link never reconnects: once it has faulted, every call returns the same
/// fault and the link must be dropped and recreated.
pub struct Link<C: Channel = Box<dyn Channel>> {
    name: String,
    channel: C,
    direction: Direction,
    state: LinkState,
    /// Encoded frame being sent, kept across `WouldBlock` so a resumed call
    /// does not re-encode; or the frame being received.
    frame: Vec<u8>,
    fault: Option<FlowError>,
    last_sequence: Option<u64>,
    stats: LinkStats,
}

impl<C: Channel> Link<C> {
    pub fn new(name: impl Into<String>, channel: C, direction: Direction) -> Self {
        Self {
            name: name.into(),
            channel,
            direction,
            state: LinkState::Idle,
            frame: Vec::new(),
            fault: None,
            last_sequence: None,
            stats: LinkStats::default(),
        }
    }

    pub fn writer(name: impl Into<String>, channel: C) -> Self {
        Self::new(name, channel, Direction::Write)
    }

    pub fn reader(name: impl Into<String>, channel: C) -> Self {
        Self::new(name, channel, Direction::Read)
    }

    /// Connect and handshake the underlying channel.
    pub fn open(&mut self) -> FlowResult<()> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        let result = self.channel.connect().and_then(|_| self.channel.init());
        if let Err(err) = result {
            return Err(self.fault_with(err));
        }
        tracing::debug!(link = %self.name, kind = %self.channel.kind(), "link open");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn fault(&self) -> Option<&FlowError> {
        self.fault.as_ref()
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    fn fault_with(&mut self, err: FlowError) -> FlowError {
        tracing::warn!(link = %self.name, error = %err, "link faulted");
        self.state = LinkState::Error;
        self.fault = Some(err.clone());
        err
    }

    fn channel_fault(&mut self) -> FlowError {
        let err = self.channel.take_error().unwrap_or_else(|| {
            FlowError::transport(self.channel.peer().clone(), TransportFault::Io, "channel failed")
        });
        self.fault_with(err)
    }

    fn check_usable(&self, wanted: Direction) -> FlowResult<()> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        if self.direction != wanted {
            return Err(FlowError::layout(format!(
                "link '{}' is a {:?} link",
                self.name, self.direction
            )));
        }
        Ok(())
    }

    /// Drive one outgoing exchange of `buffer`.
    ///
    /// Returns `Finished` once the frame is out or `WouldBlock`; calling again
    /// after `WouldBlock` resumes the same frame and ignores `buffer`.
    pub fn write<B: Serializable>(&mut self, buffer: &B) -> FlowResult<State> {
        self.check_usable(Direction::Write)?;

        if matches!(self.state, LinkState::Idle | LinkState::Finished) {
            self.frame.clear();
            buffer.encode(&mut self.frame)?;
            self.state = LinkState::Requested;
        }

        self.state = LinkState::InFlight;
        match self.channel.send(&self.frame) {
            State::Finished => {
                self.state = LinkState::Finished;
                self.stats.exchanges += 1;
                Ok(State::Finished)
            }
            State::WouldBlock => {
                self.stats.stalls += 1;
                Ok(State::WouldBlock)
            }
            State::Error => Err(self.channel_fault()),
        }
    }

    /// Drive one incoming exchange into `buffer`.
    ///
    /// A frame carrying another buffer type aborts this exchange with
    /// `ProtocolMismatch` but leaves the link usable.
    pub fn read<B: Serializable + Streamable>(&mut self, buffer: &mut B) -> FlowResult<State> {
        self.check_usable(Direction::Read)?;

        if matches!(self.state, LinkState::Idle | LinkState::Finished) {
            self.state = LinkState::Requested;
        }

        self.state = LinkState::InFlight;
        match self.channel.receive(&mut self.frame) {
            State::Finished => {}
            State::WouldBlock => {
                self.stats.stalls += 1;
                return Ok(State::WouldBlock);
            }
            State::Error => return Err(self.channel_fault()),
        }

        if let Err(err) = buffer.decode(&self.frame) {
            return Err(match err {
                FlowError::ProtocolMismatch { .. } => {
                    tracing::warn!(link = %self.name, error = %err, "dropping frame of foreign type");
                    self.state = LinkState::Idle;
                    err
                }
                FlowError::Transport { kind, message, .. } => {
                    let peer = self.channel.peer().clone();
                    self.fault_with(FlowError::Transport { peer, kind, message })
                }
                other => other,
            });
        }

        self.track_sequence(buffer.sequence());
        self.stats.exchanges += 1;
        self.state = LinkState::Finished;
        Ok(State::Finished)
    }

    fn track_sequence(&mut self, sequence: u64) {
        match self.last_sequence {
            Some(last) if sequence <= last => {
                self.stats.duplicated += 1;
                tracing::debug!(link = %self.name, sequence, last, "duplicated exchange");
                return;
            }
            Some(last) if sequence > last + 1 => {
                self.stats.lost += sequence - last - 1;
                tracing::warn!(link = %self.name, sequence, last, "lost exchanges");
            }
            _ => {}
        }
        self.last_sequence = Some(sequence);
    }

    /// Close the link. Closing in the middle of an exchange faults it.
    pub fn close(&mut self) {
        if self.fault.is_none() {
            let mid_transfer = matches!(self.state, LinkState::Requested | LinkState::InFlight);
            let err = FlowError::transport(
                self.channel.peer().clone(),
                TransportFault::Closed,
                if mid_transfer {
                    "link closed mid-transfer"
                } else {
                    "link closed"
                },
            );
            if mid_transfer {
                self.fault_with(err);
            } else {
                self.fault = Some(err);
            }
        }
        self.channel.close();
        tracing::debug!(link = %self.name, state = ?self.state, "link closed");
    }

    /// Tear down the link and hand back its channel.
    pub fn into_channel(self) -> C {
        self.channel
    }
}
