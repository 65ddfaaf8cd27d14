//! Integration tests for the listener.
//!
//! These tests exercise the full loop against real loopback TCP
//! connections: buffered sends, read dispatch, failure notification,
//! timers, and shutdown.

use sockmux::{Error, Listener, SocketHandler};
use std::io::Read;
use std::io::Write;
use std::net::{TcpListener as StdTcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

fn init_logs() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Handler that records received bytes and failure notifications.
#[derive(Clone, Default)]
struct Recorder {
    data: Arc<Mutex<Vec<u8>>>,
    failures: Arc<AtomicUsize>,
}

impl Recorder {
    fn received(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl SocketHandler for Recorder {
    fn handle_read(&mut self, data: &[u8]) {
        self.data.lock().unwrap().extend_from_slice(data);
    }

    fn handle_failure(&mut self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Create a connected (peer, to-register) pair over loopback. The peer
/// side is switched to non-blocking so tests can drain it between loop
/// iterations.
fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    peer.set_nonblocking(true).unwrap();
    (peer, server)
}

/// Drive the loop until `done` reports true, panicking after 5 seconds.
fn drive_until<F: FnMut() -> bool>(listener: &mut Listener, mut done: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out driving the loop");
        listener.wait(Some(Duration::from_millis(10))).unwrap();
    }
}

/// Drain whatever is currently readable from a non-blocking peer.
fn read_available(peer: &mut TcpStream, sink: &mut Vec<u8>) {
    let mut buf = [0u8; 4096];
    loop {
        match peer.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => sink.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("peer read failed: {e}"),
        }
    }
}

#[test]
fn test_send_drains_to_peer() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (mut peer, server) = connected_pair();

    let handle = listener.register(server, Box::new(Recorder::default())).unwrap();
    handle.send(b"abc");

    let mut got = Vec::new();
    drive_until(&mut listener, || {
        read_available(&mut peer, &mut got);
        got == b"abc"
    });
}

#[test]
fn test_read_delivers_to_handler() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (mut peer, server) = connected_pair();

    let recorder = Recorder::default();
    listener.register(server, Box::new(recorder.clone())).unwrap();

    peer.write_all(b"hello").unwrap();
    drive_until(&mut listener, || recorder.received() == b"hello");
}

#[test]
fn test_peer_hangup_fails_exactly_once() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (peer, server) = connected_pair();

    let recorder = Recorder::default();
    listener.register(server, Box::new(recorder.clone())).unwrap();

    drop(peer);
    drive_until(&mut listener, || recorder.failures() == 1);
    assert_eq!(listener.socket_count(), 0);

    // The failure is terminal: further iterations never re-notify.
    for _ in 0..5 {
        listener.wait(Some(Duration::from_millis(1))).unwrap();
    }
    assert_eq!(recorder.failures(), 1);
}

#[test]
fn test_priority_bytes_transmit_first() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (mut peer, server) = connected_pair();

    let handle = listener.register(server, Box::new(Recorder::default())).unwrap();

    // All queued before any drain: priority sends in order, then normal
    // sends in order.
    handle.send(b"nnnn");
    handle.send_priority(b"pppp");
    handle.send(b"mmmm");
    handle.send_priority(b"qqqq");

    let mut got = Vec::new();
    drive_until(&mut listener, || {
        read_available(&mut peer, &mut got);
        got.len() == 16
    });
    assert_eq!(got, b"ppppqqqqnnnnmmmm");
}

#[test]
fn test_writable_interest_rearms_after_drain() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (mut peer, server) = connected_pair();

    let handle = listener.register(server, Box::new(Recorder::default())).unwrap();
    let mut got = Vec::new();

    handle.send(b"first");
    drive_until(&mut listener, || {
        read_available(&mut peer, &mut got);
        got == b"first"
    });

    // The queue fully drained above; a fresh send must re-arm writable
    // interest and reach the peer.
    handle.send(b"second");
    drive_until(&mut listener, || {
        read_available(&mut peer, &mut got);
        got == b"firstsecond"
    });
}

#[test]
fn test_duplicate_fd_is_rejected_and_original_survives() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (mut peer, server) = connected_pair();
    let fd = server.as_raw_fd();

    let recorder = Recorder::default();
    listener.register(server, Box::new(recorder.clone())).unwrap();

    // Forge a second stream over the registered descriptor.
    let forged = unsafe { TcpStream::from_raw_fd(fd) };
    let err = listener
        .register(forged, Box::new(Recorder::default()))
        .unwrap_err();
    match err {
        Error::AlreadyRegistered(conflict) => assert_eq!(conflict, fd),
        other => panic!("expected AlreadyRegistered, got {other}"),
    }
    assert_eq!(listener.socket_count(), 1);

    // The original registration must remain functional.
    peer.write_all(b"still alive").unwrap();
    drive_until(&mut listener, || recorder.received() == b"still alive");
}

#[test]
fn test_shutdown_notifies_every_socket_once() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (_peer_a, server_a) = connected_pair();
    let (_peer_b, server_b) = connected_pair();

    let rec_a = Recorder::default();
    let rec_b = Recorder::default();
    let handle_a = listener.register(server_a, Box::new(rec_a.clone())).unwrap();
    listener.register(server_b, Box::new(rec_b.clone())).unwrap();

    listener.shutdown();
    assert_eq!(rec_a.failures(), 1);
    assert_eq!(rec_b.failures(), 1);
    assert_eq!(listener.socket_count(), 0);
    assert!(listener.is_shut_down());

    let (_peer_c, server_c) = connected_pair();
    assert!(matches!(
        listener.register(server_c, Box::new(Recorder::default())),
        Err(Error::ShutDown)
    ));
    assert!(matches!(
        listener.wait(Some(Duration::ZERO)),
        Err(Error::ShutDown)
    ));

    // Handle operations after shutdown are silent no-ops.
    handle_a.send(b"into the void");
    handle_a.send_priority(b"also dropped");
    handle_a.oneshot(Duration::ZERO, || panic!("must never fire"));
    handle_a.noshot();
    handle_a.close();
}

#[test]
fn test_voluntary_close_does_not_notify_failure() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (_peer, server) = connected_pair();

    let recorder = Recorder::default();
    let handle = listener.register(server, Box::new(recorder.clone())).unwrap();

    handle.close();
    let deadline = Instant::now() + Duration::from_secs(5);
    while listener.socket_count() > 0 {
        assert!(Instant::now() < deadline, "close was never applied");
        listener.wait(Some(Duration::from_millis(10))).unwrap();
    }
    assert_eq!(recorder.failures(), 0);

    // Idempotent, and sends on the closed handle are no-ops.
    handle.close();
    handle.send(b"dropped");
    listener.wait(Some(Duration::from_millis(1))).unwrap();
    assert_eq!(recorder.failures(), 0);
}

#[test]
fn test_oneshot_fires_after_delay() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (_peer, server) = connected_pair();

    let handle = listener.register(server, Box::new(Recorder::default())).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    handle.oneshot(Duration::from_millis(20), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });

    drive_until(&mut listener, || fired.load(Ordering::SeqCst) == 1);

    // Oneshot means once.
    for _ in 0..5 {
        listener.wait(Some(Duration::from_millis(5))).unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_delay_oneshot_fires_on_next_iteration_not_inline() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (_peer, server) = connected_pair();

    let handle = listener.register(server, Box::new(Recorder::default())).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    handle.oneshot(Duration::ZERO, move || {
        f.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    listener.wait(Some(Duration::ZERO)).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_noshot_cancels_pending_timers() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (_peer, server) = connected_pair();

    let handle = listener.register(server, Box::new(Recorder::default())).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    handle.oneshot(Duration::from_millis(30), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });
    handle.noshot();

    std::thread::sleep(Duration::from_millis(60));
    for _ in 0..3 {
        listener.wait(Some(Duration::from_millis(1))).unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failure_cancels_pending_timers() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (peer, server) = connected_pair();

    let recorder = Recorder::default();
    let handle = listener.register(server, Box::new(recorder.clone())).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    handle.oneshot(Duration::from_millis(30), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });

    drop(peer);
    drive_until(&mut listener, || recorder.failures() == 1);

    std::thread::sleep(Duration::from_millis(60));
    for _ in 0..3 {
        listener.wait(Some(Duration::from_millis(1))).unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_send_from_another_thread() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (mut peer, server) = connected_pair();

    let handle = listener.register(server, Box::new(Recorder::default())).unwrap();

    let sender = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handle.send(b"ping");
    });

    let mut got = Vec::new();
    drive_until(&mut listener, || {
        read_available(&mut peer, &mut got);
        got == b"ping"
    });
    sender.join().unwrap();
}

#[test]
fn test_handler_panic_is_isolated() {
    init_logs();

    struct PanicOnRead;

    impl SocketHandler for PanicOnRead {
        fn handle_read(&mut self, _data: &[u8]) {
            panic!("handler exploded");
        }
        fn handle_failure(&mut self) {}
    }

    let mut listener = Listener::new().unwrap();
    let (mut peer_a, server_a) = connected_pair();
    let (mut peer_b, server_b) = connected_pair();

    listener.register(server_a, Box::new(PanicOnRead)).unwrap();
    let recorder = Recorder::default();
    listener.register(server_b, Box::new(recorder.clone())).unwrap();

    peer_a.write_all(b"boom").unwrap();
    peer_b.write_all(b"fine").unwrap();

    drive_until(&mut listener, || recorder.received() == b"fine");

    // The panicking handler neither killed the loop nor its own socket.
    assert_eq!(listener.socket_count(), 2);
    assert_eq!(recorder.failures(), 0);

    // Both sockets still deliver.
    peer_a.write_all(b"again").unwrap();
    peer_b.write_all(b"more").unwrap();
    drive_until(&mut listener, || recorder.received() == b"finemore");
    assert_eq!(listener.socket_count(), 2);
}

#[test]
fn test_send_after_failure_is_noop() {
    init_logs();
    let mut listener = Listener::new().unwrap();
    let (peer, server) = connected_pair();

    let recorder = Recorder::default();
    let handle = listener.register(server, Box::new(recorder.clone())).unwrap();

    drop(peer);
    drive_until(&mut listener, || recorder.failures() == 1);

    handle.send(b"too late");
    handle.send_priority(b"way too late");
    listener.wait(Some(Duration::from_millis(1))).unwrap();
    assert_eq!(listener.socket_count(), 0);
    assert_eq!(recorder.failures(), 1);
}
