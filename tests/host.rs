//! Service host lifecycle tests: startup handshake, double-start
//! rejection, signal delivery, and clean join.

use netloop::{Context, Error, LifecycleState, Service, ServiceHost, Signal};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Default)]
struct Probe {
    started: Arc<AtomicBool>,
    signals: Arc<Mutex<Vec<Signal>>>,
}

impl Service for Probe {
    fn start(&mut self, _ctx: &Context) -> io::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn signal_handler(&mut self, signal: Signal) {
        self.signals.lock().unwrap().push(signal);
    }
}

#[test]
fn test_start_blocks_until_service_ran() {
    init_tracing();
    let started = Arc::new(AtomicBool::new(false));
    let flag = started.clone();

    let mut host = ServiceHost::new();
    host.start(move || Probe {
        started: flag,
        ..Probe::default()
    })
    .unwrap();

    // The handshake guarantees the service's start hook completed
    // before ours returned.
    assert!(started.load(Ordering::SeqCst));
    assert_eq!(host.state(), LifecycleState::Started);

    host.signal(Signal::Terminate);
    assert_eq!(
        host.wait_while(LifecycleState::Started),
        LifecycleState::Stopped
    );
}

#[test]
fn test_start_twice_is_rejected() {
    init_tracing();
    let mut host = ServiceHost::new();
    host.start(Probe::default).unwrap();

    let err = host.start(Probe::default).unwrap_err();
    assert!(matches!(err, Error::AlreadyStarted));

    // The first instance is still healthy.
    assert_eq!(host.state(), LifecycleState::Started);
    host.signal(Signal::Terminate);
    assert_eq!(
        host.wait_while(LifecycleState::Started),
        LifecycleState::Stopped
    );
}

#[test]
fn test_user1_delivered_while_running() {
    init_tracing();
    let signals = Arc::new(Mutex::new(Vec::new()));
    let log = signals.clone();

    let mut host = ServiceHost::new();
    host.start(move || Probe {
        signals: log,
        ..Probe::default()
    })
    .unwrap();

    host.signal(Signal::User1);

    let deadline = Instant::now() + Duration::from_secs(2);
    while !signals.lock().unwrap().contains(&Signal::User1) {
        assert!(Instant::now() < deadline, "user1 never delivered");
        thread::sleep(Duration::from_millis(10));
    }

    // A user signal does not stop the loop.
    assert_eq!(host.state(), LifecycleState::Started);
}

#[test]
fn test_terminate_reaches_signal_handler() {
    init_tracing();
    let signals = Arc::new(Mutex::new(Vec::new()));
    let log = signals.clone();

    let mut host = ServiceHost::new();
    host.start(move || Probe {
        signals: log,
        ..Probe::default()
    })
    .unwrap();

    host.signal(Signal::Terminate);
    host.wait_while(LifecycleState::Started);
    assert!(signals.lock().unwrap().contains(&Signal::Terminate));
}

#[test]
fn test_stop_is_idempotent() {
    init_tracing();
    let mut host = ServiceHost::new();
    host.start(Probe::default).unwrap();

    host.stop();
    assert_eq!(host.state(), LifecycleState::Stopped);
    host.stop();
    assert_eq!(host.state(), LifecycleState::Stopped);
}

#[test]
fn test_drop_without_start_is_quiet() {
    init_tracing();
    let host = ServiceHost::new();
    assert_eq!(host.state(), LifecycleState::Pending);
    drop(host);
}
