// TCP channel with [u32 LE length][bytes] framing.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use super::{Channel, ChannelKind, State};
use crate::error::{FlowError, Peer, TransportFault};

const LEN_PREFIX: usize = 4;

/// Largest frame accepted from the wire.
pub const MAX_FRAME: usize = 1 << 30;

pub struct SocketChannel {
    addr: String,
    peer: Peer,
    stream: Option<TcpStream>,
    blocking: bool,
    /// Bytes of `[prefix][frame]` already written for the current frame.
    tx_done: usize,
    rx_prefix: [u8; LEN_PREFIX],
    rx_prefix_got: usize,
    rx_len: Option<usize>,
    rx_got: usize,
    rx_frame: Vec<u8>,
    error: Option<FlowError>,
}

enum Progress {
    Done,
    Pending,
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

impl SocketChannel {
    /// A channel that connects to `addr` on [`Channel::connect`].
    pub fn new(addr: impl Into<String>, blocking: bool) -> Self {
        let addr = addr.into();
        Self {
            peer: Peer::Named(format!("tcp:{addr}")),
            addr,
            stream: None,
            blocking,
            tx_done: 0,
            rx_prefix: [0; LEN_PREFIX],
            rx_prefix_got: 0,
            rx_len: None,
            rx_got: 0,
            rx_frame: Vec::new(),
            error: None,
        }
    }

    /// Connect immediately.
    pub fn connect_to(addr: impl Into<String>, blocking: bool) -> Result<Self, FlowError> {
        let mut channel = Self::new(addr, blocking);
        channel.connect()?;
        Ok(channel)
    }

    fn from_stream(stream: TcpStream, blocking: bool) -> Result<Self, FlowError> {
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let mut channel = Self::new(addr, blocking);
        channel.configure(&stream)?;
        channel.stream = Some(stream);
        Ok(channel)
    }

    fn configure(&self, stream: &TcpStream) -> Result<(), FlowError> {
        stream
            .set_nodelay(true)
            .and_then(|_| stream.set_nonblocking(!self.blocking))
            .map_err(|e| FlowError::io(self.peer.clone(), &e))
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn fail_io(&mut self, err: &io::Error) -> State {
        self.error = Some(FlowError::io(self.peer.clone(), err));
        self.drop_stream();
        State::Error
    }

    fn fail(&mut self, kind: TransportFault, message: &str) -> State {
        self.error = Some(FlowError::transport(self.peer.clone(), kind, message));
        self.drop_stream();
        State::Error
    }

    fn drop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn pump_write(&mut self, frame: &[u8]) -> io::Result<Progress> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
        };
        let prefix = (frame.len() as u32).to_le_bytes();
        let total = LEN_PREFIX + frame.len();
        while self.tx_done < total {
            let chunk = if self.tx_done < LEN_PREFIX {
                &prefix[self.tx_done..]
            } else {
                &frame[self.tx_done - LEN_PREFIX..]
            };
            match stream.write(chunk) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped reading")),
                Ok(n) => self.tx_done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if would_block(&e) => return Ok(Progress::Pending),
                Err(e) => return Err(e),
            }
        }
        self.tx_done = 0;
        Ok(Progress::Done)
    }

    fn pump_read(&mut self) -> io::Result<Progress> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
        };
        loop {
            let len = match self.rx_len {
                Some(len) => len,
                None => {
                    match stream.read(&mut self.rx_prefix[self.rx_prefix_got..]) {
                        Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
                        Ok(n) => self.rx_prefix_got += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) if would_block(&e) => return Ok(Progress::Pending),
                        Err(e) => return Err(e),
                    }
                    if self.rx_prefix_got < LEN_PREFIX {
                        continue;
                    }
                    let len = u32::from_le_bytes(self.rx_prefix) as usize;
                    if len > MAX_FRAME {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("frame of {len} bytes exceeds limit"),
                        ));
                    }
                    self.rx_len = Some(len);
                    self.rx_got = 0;
                    self.rx_frame.clear();
                    self.rx_frame.resize(len, 0);
                    len
                }
            };
            if self.rx_got == len {
                self.rx_len = None;
                self.rx_prefix_got = 0;
                return Ok(Progress::Done);
            }
            match stream.read(&mut self.rx_frame[self.rx_got..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-frame")),
                Ok(n) => self.rx_got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if would_block(&e) => return Ok(Progress::Pending),
                Err(e) => return Err(e),
            }
        }
    }

    fn finish_read(&mut self, frame: &mut Vec<u8>, result: io::Result<Progress>) -> State {
        match result {
            Ok(Progress::Done) => {
                frame.clear();
                std::mem::swap(frame, &mut self.rx_frame);
                State::Finished
            }
            Ok(Progress::Pending) => State::WouldBlock,
            Err(e) => self.fail_io(&e),
        }
    }
}

impl Channel for SocketChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Socket
    }

    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn connect(&mut self) -> Result<(), FlowError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addrs = self
            .addr
            .to_socket_addrs()
            .map_err(|e| FlowError::transport(self.peer.clone(), TransportFault::Unreachable, e.to_string()))?;
        let mut last = None;
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    self.configure(&stream)?;
                    tracing::debug!(peer = %self.peer, "socket connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last = Some(e),
            }
        }
        let message = last.map_or_else(|| "no address resolved".to_string(), |e| e.to_string());
        Err(FlowError::transport(self.peer.clone(), TransportFault::Unreachable, message))
    }

    fn send(&mut self, frame: &[u8]) -> State {
        if frame.len() > MAX_FRAME {
            return self.fail(TransportFault::Malformed, "frame exceeds limit");
        }
        if self.stream.is_none() {
            return self.fail(TransportFault::Closed, "send on unconnected socket");
        }
        match self.pump_write(frame) {
            Ok(Progress::Done) => State::Finished,
            Ok(Progress::Pending) => State::WouldBlock,
            Err(e) => self.fail_io(&e),
        }
    }

    fn receive(&mut self, frame: &mut Vec<u8>) -> State {
        if self.stream.is_none() {
            return self.fail(TransportFault::Closed, "receive on unconnected socket");
        }
        let result = self.pump_read();
        self.finish_read(frame, result)
    }

    fn poll_receive(&mut self, frame: &mut Vec<u8>, timeout: Duration) -> State {
        let Some(stream) = self.stream.as_ref() else {
            return self.fail(TransportFault::Closed, "receive on unconnected socket");
        };
        let deadline = Instant::now() + timeout;
        let configured = stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1)))));
        if let Err(e) = configured {
            return self.fail_io(&e);
        }

        let mut result = self.pump_read();
        while matches!(result, Ok(Progress::Pending)) && Instant::now() < deadline {
            result = self.pump_read();
        }

        if let Some(stream) = self.stream.as_ref() {
            let restored = stream
                .set_read_timeout(None)
                .and_then(|_| stream.set_nonblocking(!self.blocking));
            if let Err(e) = restored {
                return self.fail_io(&e);
            }
        }
        self.finish_read(frame, result)
    }

    fn close(&mut self) {
        self.drop_stream();
        tracing::debug!(peer = %self.peer, "socket closed");
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn take_error(&mut self) -> Option<FlowError> {
        self.error.take()
    }
}

/// Accepts inbound socket channels.
pub struct SocketListener {
    listener: TcpListener,
}

impl SocketListener {
    pub fn bind(addr: &str) -> Result<Self, FlowError> {
        let listener = TcpListener::bind(addr).map_err(|e| FlowError::io(format!("tcp:{addr}"), &e))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, FlowError> {
        self.listener
            .local_addr()
            .map_err(|e| FlowError::io("tcp:listener", &e))
    }

    /// Block until one peer connects.
    pub fn accept(&self, blocking: bool) -> Result<SocketChannel, FlowError> {
        let (stream, addr) = self
            .listener
            .accept()
            .map_err(|e| FlowError::io("tcp:listener", &e))?;
        tracing::debug!(%addr, "accepted socket channel");
        SocketChannel::from_stream(stream, blocking)
    }
}
