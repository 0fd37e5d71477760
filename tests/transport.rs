// Channel backends: memory, shared memory, socket, cluster fabric and the
// async adapter. Every backend has to move whole frames in order.
//
// cargo test --test transport -- --nocapture

use rtflow::Core::alloc::SegmentAllocator;
use rtflow::Core::unlink_shared_memory;
use rtflow::Transport::memory::pair;
use rtflow::Transport::{
    AsyncAdapter, Channel, ChannelKind, Fabric, MemoryRendezvous, ShmChannel, SocketChannel, SocketListener, State,
};
use rtflow::{FlowError, Peer, TransportFault};
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn send_all(channel: &mut dyn Channel, frame: &[u8]) {
    let deadline = Instant::now() + WAIT;
    loop {
        match channel.send(frame) {
            State::Finished => return,
            State::WouldBlock => {
                assert!(Instant::now() < deadline, "send stuck");
                thread::yield_now();
            }
            State::Error => panic!("send failed: {:?}", channel.take_error()),
        }
    }
}

fn recv_one(channel: &mut dyn Channel) -> Vec<u8> {
    let mut frame = Vec::new();
    match channel.poll_receive(&mut frame, WAIT) {
        State::Finished => frame,
        other => panic!("receive returned {other:?}: {:?}", channel.take_error()),
    }
}

#[test]
fn test_memory_pair_orders_frames() {
    let (mut a, mut b) = pair("beams", 4, false);
    assert_eq!(a.kind(), ChannelKind::Memory);
    assert_eq!(a.peer(), &Peer::Named("beams/b".into()));

    for i in 0..4u8 {
        assert_eq!(a.send(&[i; 32]), State::Finished);
    }
    // Queue is full; the frame is kept and resumes later.
    assert_eq!(a.send(&[4; 32]), State::WouldBlock);

    let mut frame = Vec::new();
    for i in 0..4u8 {
        assert_eq!(b.receive(&mut frame), State::Finished);
        assert_eq!(frame, vec![i; 32]);
    }
    assert_eq!(a.send(&[4; 32]), State::Finished);
    assert_eq!(b.receive(&mut frame), State::Finished);
    assert_eq!(frame, vec![4; 32]);
    assert_eq!(b.receive(&mut frame), State::WouldBlock);
}

#[test]
fn test_memory_close_drains_then_errors() {
    let (mut a, mut b) = pair("drain", 4, false);
    a.send(b"last words");
    a.close();

    let mut frame = Vec::new();
    assert_eq!(b.receive(&mut frame), State::Finished);
    assert_eq!(frame, b"last words");
    assert_eq!(b.receive(&mut frame), State::Error);
    match b.take_error() {
        Some(FlowError::Transport { kind, .. }) => assert_eq!(kind, TransportFault::Closed),
        other => panic!("expected closed transport error, got {other:?}"),
    }
    // Sending on a closed end fails as well.
    assert_eq!(a.send(b"more"), State::Error);
}

#[test]
fn test_memory_rendezvous_pairs_by_name() {
    let rendezvous = MemoryRendezvous::new();
    let mut first = rendezvous.endpoint("station", 2, false);
    assert_eq!(rendezvous.unclaimed(), vec!["station".to_string()]);
    let mut second = rendezvous.endpoint("station", 2, false);
    assert!(rendezvous.unclaimed().is_empty());

    send_all(&mut first, b"ping");
    assert_eq!(recv_one(&mut second), b"ping");
    send_all(&mut second, b"pong");
    assert_eq!(recv_one(&mut first), b"pong");
}

#[test]
fn test_blocking_memory_across_threads() {
    let (mut a, mut b) = pair("blocking", 1, true);
    let producer = thread::spawn(move || {
        for i in 0..100u32 {
            assert_eq!(a.send(&i.to_le_bytes()), State::Finished);
        }
    });
    let mut frame = Vec::new();
    for i in 0..100u32 {
        assert_eq!(b.receive(&mut frame), State::Finished);
        assert_eq!(frame, i.to_le_bytes());
    }
    producer.join().unwrap();
}

#[test]
#[serial]
fn test_shm_pair_fragments_large_frames() {
    let name = "rtflow_test_shm_channel";
    let segment = Arc::new(SegmentAllocator::new(name, 1024 * 1024).unwrap());
    let (mut a, mut b) = ShmChannel::pair(segment, 8, 64, false).unwrap();
    assert_eq!(a.kind(), ChannelKind::SharedMemory);

    // Larger than the whole ring: needs the receiver to drain mid-frame.
    let big: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let receiver = thread::spawn(move || {
        let small = recv_one(&mut b);
        let large = recv_one(&mut b);
        (small, large, b)
    });

    send_all(&mut a, b"tiny");
    send_all(&mut a, &big);
    let (small, large, mut b) = receiver.join().unwrap();
    assert_eq!(small, b"tiny");
    assert_eq!(large, big);

    // The other direction works too.
    send_all(&mut b, b"ack");
    assert_eq!(recv_one(&mut a), b"ack");

    a.close();
    let mut frame = Vec::new();
    assert_eq!(b.receive(&mut frame), State::Error);
    unlink_shared_memory(name).unwrap();
}

#[test]
#[serial]
fn test_shm_open_unknown_band_is_unreachable() {
    let name = "rtflow_test_shm_unknown";
    let segment = Arc::new(SegmentAllocator::new(name, 256 * 1024).unwrap());
    match ShmChannel::receiver(segment, 7, false) {
        Err(FlowError::Transport { kind, .. }) => assert_eq!(kind, TransportFault::Unreachable),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("band 7 should not exist"),
    }
    unlink_shared_memory(name).unwrap();
}

#[test]
fn test_socket_round_trip() {
    let listener = SocketListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut channel = listener.accept(true).unwrap();
        let mut frame = Vec::new();
        // Echo three frames back.
        for _ in 0..3 {
            assert_eq!(channel.receive(&mut frame), State::Finished);
            assert_eq!(channel.send(&frame), State::Finished);
        }
    });

    let mut client = SocketChannel::connect_to(addr.to_string(), false).unwrap();
    assert_eq!(client.kind(), ChannelKind::Socket);
    let big = vec![0x5a; 256 * 1024];
    for frame in [&b"one"[..], &big[..], &b""[..]] {
        send_all(&mut client, frame);
        assert_eq!(recv_one(&mut client), frame);
    }
    server.join().unwrap();

    // The server hung up.
    let mut frame = Vec::new();
    assert_eq!(client.poll_receive(&mut frame, WAIT), State::Error);
    assert!(matches!(client.take_error(), Some(FlowError::Transport { .. })));
}

#[test]
fn test_socket_connect_refused_is_unreachable() {
    // Bind and drop to find a port nobody listens on.
    let addr = SocketListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let mut channel = SocketChannel::new(addr.to_string(), false);
    match channel.connect() {
        Err(FlowError::Transport { kind, .. }) => assert_eq!(kind, TransportFault::Unreachable),
        other => panic!("expected unreachable, got {other:?}"),
    }
}

#[test]
fn test_cluster_channels_are_tag_separated() {
    let fabric = Fabric::new(2);
    let zero = fabric.endpoint(0).unwrap();
    let one = fabric.endpoint(1).unwrap();

    let mut data_out = zero.channel(1, 10, false);
    let mut ctrl_out = zero.channel(1, 11, false);
    let mut data_in = one.channel(0, 10, false);
    let mut ctrl_in = one.channel(0, 11, false);

    assert_eq!(data_out.send(b"samples"), State::Finished);
    assert_eq!(ctrl_out.send(b"stop"), State::Finished);

    let mut frame = Vec::new();
    assert_eq!(ctrl_in.receive(&mut frame), State::Finished);
    assert_eq!(frame, b"stop");
    assert_eq!(data_in.receive(&mut frame), State::Finished);
    assert_eq!(frame, b"samples");
    assert_eq!(data_in.receive(&mut frame), State::WouldBlock);

    // Raw endpoint access on a third tag.
    assert!(!one.recv_timeout(0, 12, &mut frame, Duration::from_millis(5)).unwrap());
    zero.send(1, 12, b"raw").unwrap();
    assert!(one.recv_timeout(0, 12, &mut frame, WAIT).unwrap());
    assert_eq!(frame, b"raw");
}

#[test]
fn test_cluster_failed_rank_is_reported() {
    let fabric = Fabric::new(3);
    let zero = fabric.endpoint(0).unwrap();
    let mut to_two = zero.channel(2, 0, false);
    let mut from_two = zero.channel(2, 0, false);

    fabric.endpoint(2).unwrap().leave();
    assert!(!fabric.is_alive(2));
    assert_eq!(to_two.send(b"x"), State::Error);
    match to_two.take_error() {
        Some(err) => assert_eq!(err.peer(), Some(&Peer::Rank(2))),
        None => panic!("missing error"),
    }

    let mut frame = Vec::new();
    assert_eq!(from_two.receive(&mut frame), State::Error);
    assert!(fabric.endpoint(3).is_err());
}

#[test]
fn test_cluster_close_is_seen_by_peer_after_drain() {
    let fabric = Fabric::new(2);
    let mut closing = fabric.endpoint(0).unwrap().channel(1, 5, false);
    let mut drained = fabric.endpoint(1).unwrap().channel(0, 5, false);
    let mut waiting = fabric.endpoint(1).unwrap().channel(0, 6, true);
    let mut closing_ctrl = fabric.endpoint(0).unwrap().channel(1, 6, false);

    // A blocking receive parked on a route wakes up when that route closes.
    let (tx, rx) = crossbeam_channel::bounded(1);
    let waiter = thread::spawn(move || {
        let mut frame = Vec::new();
        let state = waiting.receive(&mut frame);
        let _ = tx.send((state, waiting.take_error()));
    });
    thread::sleep(Duration::from_millis(20));
    closing_ctrl.close();
    let (state, err) = rx.recv_timeout(WAIT).expect("blocked receive never saw the close");
    assert_eq!(state, State::Error);
    assert_eq!(err.as_ref().and_then(FlowError::peer), Some(&Peer::Rank(0)));
    waiter.join().unwrap();

    // Frames delivered before the close are still drained first.
    assert_eq!(closing.send(b"last"), State::Finished);
    closing.close();
    let mut frame = Vec::new();
    assert_eq!(drained.poll_receive(&mut frame, WAIT), State::Finished);
    assert_eq!(frame, b"last");
    assert_eq!(drained.poll_receive(&mut frame, Duration::from_millis(50)), State::Error);
    match drained.take_error() {
        Some(FlowError::Transport { peer, kind, .. }) => {
            assert_eq!(peer, Peer::Rank(0));
            assert_eq!(kind, TransportFault::Closed);
        }
        other => panic!("expected closed, got {other:?}"),
    }
    // The route is closed in the other direction as well.
    assert_eq!(drained.send(b"late"), State::Error);
    assert_eq!(closing.send(b"again"), State::Error);
}

#[test]
fn test_async_adapter_over_blocking_channel() {
    let (inner, mut remote) = pair("adapted", 2, true);
    let mut adapter = AsyncAdapter::spawn(Box::new(inner));
    assert_eq!(adapter.kind(), ChannelKind::Adapted);
    assert!(!adapter.is_blocking());

    // Non-blocking receive on an idle adapter never waits.
    let mut frame = Vec::new();
    let started = Instant::now();
    assert_eq!(adapter.receive(&mut frame), State::WouldBlock);
    assert!(started.elapsed() < Duration::from_millis(100));

    for i in 0..10u8 {
        send_all(&mut adapter, &[i; 8]);
    }
    for i in 0..10u8 {
        assert_eq!(remote.receive(&mut frame), State::Finished);
        assert_eq!(frame, vec![i; 8]);
    }

    assert_eq!(remote.send(b"reply"), State::Finished);
    assert_eq!(recv_one(&mut adapter), b"reply");

    // The helper sees the peer go away and the adapter reports it.
    remote.close();
    let deadline = Instant::now() + WAIT;
    loop {
        match adapter.receive(&mut frame) {
            State::Error => break,
            _ => {
                assert!(Instant::now() < deadline, "adapter never reported the closed peer");
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
    assert!(adapter.take_error().is_some());
    adapter.close();
}
