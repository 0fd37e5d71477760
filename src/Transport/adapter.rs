// Async-capable facade over a blocking channel, driven by one helper thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use parking_lot::Mutex;

use super::{Channel, ChannelKind, State};
use crate::error::{FlowError, Peer, TransportFault};

/// Frames queued in each direction between caller and helper.
const QUEUE_DEPTH: usize = 16;

/// How long the helper waits for inbound data before checking outbound work.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Owns a blocking [`Channel`] on a helper thread and exposes it as a
/// non-blocking one.
pub struct AsyncAdapter {
    peer: Peer,
    outbound: Option<Sender<Vec<u8>>>,
    inbound: Receiver<Vec<u8>>,
    /// Vectors returned by the helper after sending, for reuse.
    spent: Receiver<Vec<u8>>,
    pending: Option<Vec<u8>>,
    fault: Arc<Mutex<Option<FlowError>>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    can_send: bool,
    can_receive: bool,
    error: Option<FlowError>,
}

impl AsyncAdapter {
    pub fn spawn(mut inner: Box<dyn Channel>) -> Self {
        let peer = inner.peer().clone();
        let can_send = inner.can_send();
        let can_receive = inner.can_receive();
        let (out_tx, out_rx) = bounded::<Vec<u8>>(QUEUE_DEPTH);
        let (in_tx, in_rx) = bounded::<Vec<u8>>(QUEUE_DEPTH);
        let (spent_tx, spent_rx) = bounded::<Vec<u8>>(QUEUE_DEPTH);
        let fault = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let fault = fault.clone();
            let shutdown = shutdown.clone();
            let name = format!("adapter-{peer}");
            thread::Builder::new().name(name).spawn(move || {
                let mut frame = Vec::new();
                let result = pump(&mut *inner, &out_rx, &in_tx, &spent_tx, &shutdown, &mut frame);
                if let Err(err) = result {
                    tracing::warn!(peer = %inner.peer(), error = %err, "adapted channel failed");
                    *fault.lock() = Some(err);
                }
                inner.close();
            })
        };

        let (worker, startup_error) = match worker {
            Ok(handle) => (Some(handle), None),
            Err(e) => (None, Some(FlowError::io(peer.clone(), &e))),
        };
        if let Some(err) = startup_error {
            *fault.lock() = Some(err);
        }

        Self {
            peer,
            outbound: Some(out_tx),
            inbound: in_rx,
            spent: spent_rx,
            pending: None,
            fault,
            shutdown,
            worker,
            can_send,
            can_receive,
            error: None,
        }
    }

    fn fail_from_helper(&mut self) -> State {
        let err = self.fault.lock().clone().unwrap_or_else(|| {
            FlowError::transport(self.peer.clone(), TransportFault::Closed, "adapter stopped")
        });
        self.error = Some(err);
        State::Error
    }

    fn deliver(&mut self, mut incoming: Vec<u8>, frame: &mut Vec<u8>) -> State {
        std::mem::swap(frame, &mut incoming);
        State::Finished
    }
}

fn pump(
    inner: &mut dyn Channel,
    outbound: &Receiver<Vec<u8>>,
    inbound: &Sender<Vec<u8>>,
    spent: &Sender<Vec<u8>>,
    shutdown: &AtomicBool,
    frame: &mut Vec<u8>,
) -> Result<(), FlowError> {
    let channel_error = |inner: &mut dyn Channel| {
        inner.take_error().unwrap_or_else(|| {
            FlowError::transport(inner.peer().clone(), TransportFault::Io, "channel reported an error")
        })
    };

    loop {
        // Queued frames are flushed before a requested stop takes effect.
        let stopping = shutdown.load(Ordering::Acquire);
        let mut idle = true;
        if inner.can_send() {
            loop {
                match outbound.try_recv() {
                    Ok(mut out) => {
                        idle = false;
                        if inner.send(&out) == State::Error {
                            return Err(channel_error(inner));
                        }
                        out.clear();
                        let _ = spent.try_send(out);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) if inner.can_receive() && !stopping => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }
        }
        if stopping {
            return Ok(());
        }

        if inner.can_receive() {
            match inner.poll_receive(frame, POLL_INTERVAL) {
                State::Finished => {
                    let mut delivered = std::mem::take(frame);
                    loop {
                        match inbound.send_timeout(delivered, POLL_INTERVAL) {
                            Ok(()) => break,
                            Err(SendTimeoutError::Timeout(_)) if shutdown.load(Ordering::Acquire) => {
                                return Ok(())
                            }
                            Err(SendTimeoutError::Timeout(back)) => delivered = back,
                            Err(SendTimeoutError::Disconnected(_)) => return Ok(()),
                        }
                    }
                }
                State::WouldBlock => {}
                State::Error => return Err(channel_error(inner)),
            }
        } else if idle {
            match outbound.recv_timeout(POLL_INTERVAL) {
                Ok(mut out) => {
                    if inner.send(&out) == State::Error {
                        return Err(channel_error(inner));
                    }
                    out.clear();
                    let _ = spent.try_send(out);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }
}

impl Channel for AsyncAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Adapted
    }

    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn send(&mut self, frame: &[u8]) -> State {
        let Some(outbound) = self.outbound.clone() else {
            self.error = Some(FlowError::transport(self.peer.clone(), TransportFault::Closed, "adapter closed"));
            return State::Error;
        };
        if self.fault.lock().is_some() {
            return self.fail_from_helper();
        }
        let out = match self.pending.take() {
            Some(out) => out,
            None => {
                let mut out = self.spent.try_recv().unwrap_or_default();
                out.clear();
                out.extend_from_slice(frame);
                out
            }
        };
        match outbound.try_send(out) {
            Ok(()) => State::Finished,
            Err(TrySendError::Full(back)) => {
                self.pending = Some(back);
                State::WouldBlock
            }
            Err(TrySendError::Disconnected(_)) => self.fail_from_helper(),
        }
    }

    fn receive(&mut self, frame: &mut Vec<u8>) -> State {
        match self.inbound.try_recv() {
            Ok(incoming) => self.deliver(incoming, frame),
            Err(TryRecvError::Empty) if self.fault.lock().is_none() => State::WouldBlock,
            Err(_) => self.fail_from_helper(),
        }
    }

    fn poll_receive(&mut self, frame: &mut Vec<u8>, timeout: Duration) -> State {
        match self.inbound.recv_timeout(timeout) {
            Ok(incoming) => self.deliver(incoming, frame),
            Err(RecvTimeoutError::Timeout) if self.fault.lock().is_none() => State::WouldBlock,
            Err(_) => self.fail_from_helper(),
        }
    }

    fn close(&mut self) {
        self.outbound = None;
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn supports_async(&self) -> bool {
        true
    }

    fn can_send(&self) -> bool {
        self.can_send
    }

    fn can_receive(&self) -> bool {
        self.can_receive
    }

    fn take_error(&mut self) -> Option<FlowError> {
        self.error.take()
    }
}

impl Drop for AsyncAdapter {
    fn drop(&mut self) {
        self.close();
    }
}
