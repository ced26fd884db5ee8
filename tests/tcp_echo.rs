//! End-to-end TCP echo tests: a hosted echo service exercised with
//! blocking loopback clients, then drained through terminate.

use netloop::{
    Context, LifecycleState, ServiceHost, Signal, StreamHandler, StreamSession, TcpService,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Get an available port for testing.
fn get_available_port(host: &str) -> u16 {
    let listener = TcpListener::bind((host, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// Loopback IPv6 is not available everywhere; probe before using it.
fn ipv6_available() -> bool {
    TcpListener::bind(("::1", 0)).is_ok()
}

struct Echo {
    stops: Arc<AtomicUsize>,
}

impl StreamHandler for Echo {
    fn service(&mut self, ctx: &Context, session: &StreamSession, data: Option<&[u8]>) {
        match data {
            // Connection closed: stage nothing, the connection drops.
            None => {}
            // Fresh connection: stage the first read.
            Some([]) => session.submit_recv(ctx),
            // Echo the bytes back, then read again.
            Some(data) => {
                let next = session.clone();
                session.send(ctx, data, move |ctx, result| {
                    if result.is_ok() {
                        next.submit_recv(ctx);
                    }
                });
            }
        }
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn start_echo(addr: SocketAddr) -> (ServiceHost, Arc<AtomicUsize>) {
    let stops = Arc::new(AtomicUsize::new(0));
    let counter = stops.clone();
    let mut host = ServiceHost::new();
    host.start(move || TcpService::new(addr, Echo { stops: counter }))
        .unwrap();
    (host, stops)
}

fn wait_stopped(host: &ServiceHost, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while host.state() != LifecycleState::Stopped {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
    true
}

fn connect(addr: SocketAddr) -> TcpStream {
    let client = TcpStream::connect(addr).unwrap();
    client.set_nodelay(true).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client
}

fn echo_alphabet(client: &mut TcpStream) {
    for byte in b'a'..=b'z' {
        client.write_all(&[byte]).unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], byte);
    }
}

#[test]
fn test_echo_roundtrip_v4() {
    let addr: SocketAddr = format!("127.0.0.1:{}", get_available_port("127.0.0.1"))
        .parse()
        .unwrap();
    let (host, _stops) = start_echo(addr);
    assert_eq!(host.state(), LifecycleState::Started);

    // The service is listening the moment start returns.
    let mut client = connect(addr);
    echo_alphabet(&mut client);
    drop(client);

    // The drain completes within four 50 ms wakes.
    host.signal(Signal::Terminate);
    assert!(wait_stopped(&host, Duration::from_millis(200)));
}

#[test]
fn test_echo_roundtrip_v6() {
    if !ipv6_available() {
        return;
    }

    let addr: SocketAddr = format!("[::1]:{}", get_available_port("::1"))
        .parse()
        .unwrap();
    let (host, _stops) = start_echo(addr);

    let mut client = connect(addr);
    echo_alphabet(&mut client);
    drop(client);

    // The drain completes within four 50 ms wakes.
    host.signal(Signal::Terminate);
    assert!(wait_stopped(&host, Duration::from_millis(200)));
}

#[test]
fn test_terminate_without_traffic_drains_promptly() {
    let addr: SocketAddr = format!("127.0.0.1:{}", get_available_port("127.0.0.1"))
        .parse()
        .unwrap();
    let (host, stops) = start_echo(addr);

    // Nothing is in flight, so the drain is bounded by a handful of
    // 50 ms wakes, not a generous timeout.
    host.signal(Signal::Terminate);
    assert!(wait_stopped(&host, Duration::from_millis(200)));
    assert!(stops.load(Ordering::SeqCst) >= 1);
}

/// A long-lived connection keeps the loop draining after terminate; the
/// periodic one-second nudge must keep poking the handler until a timer
/// finally closes the client and lets the loop run dry.
#[test]
fn test_timer_drain_under_terminate() {
    let addr: SocketAddr = format!("127.0.0.1:{}", get_available_port("127.0.0.1"))
        .parse()
        .unwrap();
    let (host, stops) = start_echo(addr);

    let mut client = connect(addr);
    client.write_all(b"x").unwrap();
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).unwrap();

    // Park the client with the timer wheel; the handler drops it 3.5
    // seconds in, while the terminate nudge fires every second.
    let parked = Arc::new(std::sync::Mutex::new(Some(client)));
    let slot = parked.clone();
    host.timers().add(Duration::from_millis(3500), move |_| {
        slot.lock().unwrap().take();
    });
    thread::sleep(Duration::from_millis(10));

    host.signal(Signal::Terminate);
    assert!(wait_stopped(&host, Duration::from_secs(6)));
    assert!(stops.load(Ordering::SeqCst) >= 2);
}
