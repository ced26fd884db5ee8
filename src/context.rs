//! Asynchronous execution context.
//!
//! A [`Context`] weaves four signal sources into one deterministic run
//! loop: timer expirations, socket readiness, the out-of-band signal
//! mailbox, and the staged asynchronous operations that make up the
//! user service's continuation chains.
//!
//! Operations staged with the `spawn_*` methods are never attempted
//! synchronously inside the caller; they run in the loop's next drain
//! step. A handler may therefore stage follow-up work from inside a
//! completion without reentering itself.

use crate::host::Lifecycle;
use crate::poller::{Dialog, PollEvent, Poller};
use crate::service::ReadContext;
use crate::sys;
use crate::timer::TimerWheel;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

bitflags! {
    /// Mailbox bits. Writers OR a bit in; the ISR exchanges the whole
    /// mask to zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SignalSet: u64 {
        const TERMINATE = 1 << 0;
        const USER1 = 1 << 1;
    }
}

impl SignalSet {
    pub(crate) fn signals(self) -> impl Iterator<Item = Signal> {
        [Signal::Terminate, Signal::User1]
            .into_iter()
            .filter(move |signal| self.contains(signal.mask()))
    }
}

/// Out-of-band signals a service can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Request the service to quiesce and the loop to drain.
    Terminate,
    /// Application-defined.
    User1,
}

impl Signal {
    pub(crate) fn mask(self) -> SignalSet {
        match self {
            Signal::Terminate => SignalSet::TERMINATE,
            Signal::User1 => SignalSet::USER1,
        }
    }
}

/// State shared between the loop thread and external callers. Only this
/// surface (plus the timer wheel) is touchable from other threads.
pub(crate) struct Shared {
    pub(crate) sigmask: AtomicU64,
    pub(crate) stop: AtomicBool,
    pub(crate) timers: TimerWheel,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) startup_error: Mutex<Option<io::Error>>,
}

impl Shared {
    pub(crate) fn new() -> Arc<Shared> {
        Arc::new(Shared {
            sigmask: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            timers: TimerWheel::new(),
            lifecycle: Lifecycle::new(),
            startup_error: Mutex::new(None),
        })
    }

    pub(crate) fn raise(&self, signal: Signal) {
        self.sigmask.fetch_or(signal.mask().bits(), Ordering::SeqCst);
        self.timers.wakeup().interrupt();
    }

    /// Exchange the mailbox to zero, observing every bit raised since the
    /// previous pass.
    pub(crate) fn take_signals(&self) -> SignalSet {
        SignalSet::from_bits_truncate(self.sigmask.swap(0, Ordering::SeqCst))
    }

    pub(crate) fn record_startup_error(&self, err: io::Error) {
        *self.startup_error.lock() = Some(err);
    }

    pub(crate) fn take_startup_error(&self) -> Option<io::Error> {
        self.startup_error.lock().take()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    Read,
    Write,
}

type AcceptComplete = Box<dyn FnOnce(&Context, io::Result<(Dialog, SocketAddr)>)>;
type ConnectComplete = Box<dyn FnOnce(&Context, io::Result<()>)>;
type IoComplete = Box<dyn FnOnce(&Context, io::Result<usize>)>;
type RecvComplete = Box<dyn FnOnce(&Context, io::Result<(usize, Option<SocketAddr>)>)>;

enum Operation {
    Accept {
        dialog: Dialog,
        complete: AcceptComplete,
    },
    Connect {
        dialog: Dialog,
        addr: SocketAddr,
        /// Set once the connect syscall has been issued; readiness after
        /// that reports the outcome via `SO_ERROR`.
        initiated: bool,
        complete: ConnectComplete,
    },
    Recv {
        dialog: Dialog,
        rctx: ReadContext,
        complete: RecvComplete,
    },
    /// Read-and-discard, used by the interrupt service routine.
    Drain {
        dialog: Dialog,
        complete: IoComplete,
    },
    Send {
        dialog: Dialog,
        data: Vec<u8>,
        dest: Option<SocketAddr>,
        complete: IoComplete,
    },
}

impl Operation {
    fn key(&self) -> (usize, Direction) {
        match self {
            Operation::Accept { dialog, .. }
            | Operation::Recv { dialog, .. }
            | Operation::Drain { dialog, .. } => (dialog.token(), Direction::Read),
            Operation::Connect { dialog, .. } | Operation::Send { dialog, .. } => {
                (dialog.token(), Direction::Write)
            }
        }
    }
}

/// The set of in-flight operations owned by the context. One parked read
/// and one parked write per dialog.
#[derive(Default)]
struct Scope {
    staged: RefCell<VecDeque<Operation>>,
    parked: RefCell<HashMap<(usize, Direction), Operation>>,
}

/// The event loop context: poll multiplexer, async-operation scope,
/// timer wheel, signal mailbox and interrupt channel.
pub struct Context {
    shared: Arc<Shared>,
    scope: Scope,
    poller: Poller,
}

impl Context {
    pub(crate) fn new(shared: Arc<Shared>) -> io::Result<Self> {
        Ok(Self {
            shared,
            scope: Scope::default(),
            poller: Poller::new()?,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn timers(&self) -> &TimerWheel {
        &self.shared.timers
    }

    /// Raise `signal` in the mailbox and poke the loop. Thread-safe.
    pub fn signal(&self, signal: Signal) {
        self.shared.raise(signal);
    }

    /// Wake a blocked multiplexer. Thread-safe.
    pub fn interrupt(&self) {
        self.shared.timers.wakeup().interrupt();
    }

    /// Ask in-flight chains to short-circuit at their next step.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Stage an accept on a listening dialog. The completion receives the
    /// registered dialog of the new connection and the peer address.
    pub fn spawn_accept(
        &self,
        dialog: &Dialog,
        complete: impl FnOnce(&Context, io::Result<(Dialog, SocketAddr)>) + 'static,
    ) {
        self.stage(Operation::Accept {
            dialog: dialog.clone(),
            complete: Box::new(complete),
        });
    }

    /// Stage a nonblocking connect on `dialog`. The completion runs once
    /// the handshake has succeeded or failed.
    pub fn spawn_connect(
        &self,
        dialog: &Dialog,
        addr: SocketAddr,
        complete: impl FnOnce(&Context, io::Result<()>) + 'static,
    ) {
        self.stage(Operation::Connect {
            dialog: dialog.clone(),
            addr,
            initiated: false,
            complete: Box::new(complete),
        });
    }

    /// Stage a receive into the shared read context. The completion gets
    /// the byte count and, for datagram sockets, the source address.
    pub fn spawn_recv(
        &self,
        dialog: &Dialog,
        rctx: &ReadContext,
        complete: impl FnOnce(&Context, io::Result<(usize, Option<SocketAddr>)>) + 'static,
    ) {
        self.stage(Operation::Recv {
            dialog: dialog.clone(),
            rctx: rctx.clone(),
            complete: Box::new(complete),
        });
    }

    pub(crate) fn spawn_drain(
        &self,
        dialog: &Dialog,
        complete: impl FnOnce(&Context, io::Result<usize>) + 'static,
    ) {
        self.stage(Operation::Drain {
            dialog: dialog.clone(),
            complete: Box::new(complete),
        });
    }

    /// Stage a send. `dest` addresses a datagram; `None` sends on a
    /// connected stream.
    pub fn spawn_send(
        &self,
        dialog: &Dialog,
        data: &[u8],
        dest: Option<SocketAddr>,
        complete: impl FnOnce(&Context, io::Result<usize>) + 'static,
    ) {
        self.stage(Operation::Send {
            dialog: dialog.clone(),
            data: data.to_vec(),
            dest,
            complete: Box::new(complete),
        });
    }

    /// Install a persistent readiness consumer on `dialog`.
    ///
    /// `routine` runs immediately; while it returns `true` the context
    /// keeps one read-and-discard in flight and re-invokes the routine on
    /// every successful completion. A read error tears the chain down
    /// silently.
    pub fn isr(&self, dialog: Dialog, routine: impl FnMut() -> bool + 'static) {
        self.isr_boxed(dialog, Box::new(routine));
    }

    fn isr_boxed(&self, dialog: Dialog, mut routine: Box<dyn FnMut() -> bool>) {
        if !routine() {
            return;
        }
        let chain = dialog.clone();
        self.spawn_drain(&dialog, move |ctx, result| {
            if result.is_ok() {
                ctx.isr_boxed(chain, routine);
            }
        });
    }

    /// Run the event loop to quiescence.
    ///
    /// Each pass runs staged operations, resolves timers, blocks the
    /// multiplexer until the next timer deadline, and dispatches
    /// readiness to parked operations. The loop exits once a pass
    /// delivered no events and no dialogs remain registered.
    pub fn run(&self) {
        loop {
            self.drain_staged();

            let timeout = self.shared.timers.resolve();
            let events = match self.poller.wait_for(timeout) {
                Ok(events) => events,
                Err(err) => {
                    tracing::error!("multiplexer failure, abandoning loop: {err}");
                    break;
                }
            };

            for event in &events {
                self.dispatch(event);
            }

            if events.is_empty() && self.poller.is_empty() {
                break;
            }
        }
    }

    fn stage(&self, op: Operation) {
        self.scope.staged.borrow_mut().push_back(op);
    }

    fn park(&self, op: Operation) {
        let previous = self.scope.parked.borrow_mut().insert(op.key(), op);
        debug_assert!(
            previous.is_none(),
            "one in-flight operation per dialog and direction"
        );
    }

    fn drain_staged(&self) {
        loop {
            let Some(op) = self.scope.staged.borrow_mut().pop_front() else {
                break;
            };
            self.attempt(op);
        }
    }

    fn dispatch(&self, event: &PollEvent) {
        if event.readable || event.closed || event.error {
            let op = self
                .scope
                .parked
                .borrow_mut()
                .remove(&(event.token, Direction::Read));
            if let Some(op) = op {
                self.attempt(op);
            }
        }
        if event.writable || event.closed || event.error {
            let op = self
                .scope
                .parked
                .borrow_mut()
                .remove(&(event.token, Direction::Write));
            if let Some(op) = op {
                self.attempt(op);
            }
        }
    }

    /// Try the operation's system call. `WouldBlock` parks it until the
    /// next readiness event for its dialog; anything else completes it.
    fn attempt(&self, op: Operation) {
        match op {
            Operation::Accept { dialog, complete } => match sys::accept(dialog.raw_fd()) {
                Ok((socket, peer)) => {
                    let result = self.poller.emplace(socket).map(|conn| (conn, peer));
                    complete(self, result);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.park(Operation::Accept { dialog, complete });
                }
                Err(err) => complete(self, Err(err)),
            },

            Operation::Connect {
                dialog,
                addr,
                initiated,
                complete,
            } => {
                let result = if initiated {
                    sys::take_socket_error(dialog.raw_fd())
                } else {
                    sys::connect(dialog.raw_fd(), &addr)
                };
                match result {
                    Err(err)
                        if !initiated
                            && (err.raw_os_error() == Some(libc::EINPROGRESS)
                                || err.kind() == io::ErrorKind::WouldBlock) =>
                    {
                        self.park(Operation::Connect {
                            dialog,
                            addr,
                            initiated: true,
                            complete,
                        });
                    }
                    result => complete(self, result),
                }
            }

            Operation::Recv {
                dialog,
                rctx,
                complete,
            } => match rctx.fill_from(dialog.raw_fd()) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.park(Operation::Recv {
                        dialog,
                        rctx,
                        complete,
                    });
                }
                result => complete(self, result),
            },

            Operation::Drain { dialog, complete } => {
                let mut buf = [0u8; 1024];
                match sys::recv_from(dialog.raw_fd(), &mut buf) {
                    Ok((n, _)) => complete(self, Ok(n)),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        self.park(Operation::Drain { dialog, complete });
                    }
                    Err(err) => complete(self, Err(err)),
                }
            }

            Operation::Send {
                dialog,
                data,
                dest,
                complete,
            } => {
                let result = match &dest {
                    Some(addr) => sys::send_to(dialog.raw_fd(), &data, addr),
                    None => sys::send(dialog.raw_fd(), &data),
                };
                match result {
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        self.park(Operation::Send {
                            dialog,
                            data,
                            dest,
                            complete,
                        });
                    }
                    result => complete(self, result),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_signal_bits_accumulate_until_taken() {
        let _guard = sys::fault::lock();
        let shared = Shared::new();
        shared.timers.wakeup().open().unwrap();
        let ctx = Context::new(shared.clone()).unwrap();

        ctx.signal(Signal::Terminate);
        ctx.signal(Signal::User1);

        let pending = shared.take_signals();
        assert_eq!(pending, SignalSet::TERMINATE | SignalSet::USER1);
        assert!(shared.take_signals().is_empty());

        // Both signals poked the wakeup channel.
        let reader = shared.timers.wakeup().take_reader();
        let mut buf = [0u8; 8];
        let (n, _) = sys::recv_from(reader, &mut buf).unwrap();
        assert_eq!(n, 2);
        sys::close(reader);
    }

    #[test]
    fn test_signal_set_iteration() {
        let set = SignalSet::TERMINATE | SignalSet::USER1;
        let signals: Vec<_> = set.signals().collect();
        assert_eq!(signals, vec![Signal::Terminate, Signal::User1]);
        assert_eq!(SignalSet::empty().signals().count(), 0);
    }

    #[test]
    fn test_run_returns_when_nothing_registered() {
        let shared = Shared::new();
        let ctx = Context::new(shared).unwrap();
        ctx.run();
    }

    #[test]
    fn test_isr_routine_false_spawns_nothing() {
        let _guard = sys::fault::lock();
        let shared = Shared::new();
        let ctx = Context::new(shared).unwrap();

        let (a, _b) = sys::socket_pair().unwrap();
        let dialog = ctx.poller().emplace(a).unwrap();

        let calls = Rc::new(Cell::new(0));
        let count = calls.clone();
        ctx.isr(dialog, move || {
            count.set(count.get() + 1);
            false
        });

        assert_eq!(calls.get(), 1);
        assert!(ctx.scope.staged.borrow().is_empty());
    }

    #[test]
    fn test_isr_reinvoked_per_wakeup_byte() {
        let _guard = sys::fault::lock();
        let shared = Shared::new();
        shared.timers.wakeup().open().unwrap();
        let ctx = Context::new(shared.clone()).unwrap();

        let reader = shared.timers.wakeup().take_reader();
        let dialog = ctx.poller().emplace_raw(reader).unwrap();

        let calls = Rc::new(Cell::new(0));
        let count = calls.clone();
        ctx.isr(dialog, move || {
            count.set(count.get() + 1);
            count.get() < 2
        });

        ctx.interrupt();
        ctx.run();

        // Once at install, once for the wakeup byte; the second call
        // returned false, tearing the chain down and emptying the poller.
        assert_eq!(calls.get(), 2);
        assert!(ctx.poller().is_empty());
    }

    #[test]
    fn test_staged_recv_completes_and_drains() {
        let _guard = sys::fault::lock();
        let shared = Shared::new();
        let ctx = Context::new(shared).unwrap();

        let (a, b) = sys::socket_pair().unwrap();
        let dialog = ctx.poller().emplace(a).unwrap();
        sys::send(sys::raw_fd(&b), b"ping").unwrap();

        let rctx = ReadContext::new();
        let received = Rc::new(Cell::new(0));
        let got = received.clone();
        ctx.spawn_recv(&dialog, &rctx, move |_ctx, result| {
            let (n, _) = result.unwrap();
            got.set(n);
        });
        drop(dialog);

        ctx.run();
        assert_eq!(received.get(), 4);
        assert!(ctx.poller().is_empty());
    }

    #[test]
    fn test_parked_send_resumes_on_writable() {
        let _guard = sys::fault::lock();
        let shared = Shared::new();
        let ctx = Context::new(shared).unwrap();

        let (a, b) = sys::socket_pair().unwrap();
        let dialog = ctx.poller().emplace(a).unwrap();

        // Fill the pipe until the kernel pushes back, then stage one more
        // send; it must park and resume once the peer drains.
        let chunk = vec![0u8; 64 * 1024];
        while sys::send(dialog.raw_fd(), &chunk).is_ok() {}

        let sent = Rc::new(Cell::new(false));
        let done = sent.clone();
        ctx.spawn_send(&dialog, b"x", None, move |_ctx, result| {
            assert!(result.unwrap() > 0);
            done.set(true);
        });
        drop(dialog);

        let reader = std::thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match sys::recv_from(sys::raw_fd(&b), &mut buf) {
                    Ok((0, _)) => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                    Err(_) => break,
                }
            }
        });

        ctx.run();
        assert!(sent.get());
        reader.join().unwrap();
    }

    #[test]
    fn test_connect_and_accept_complete_in_one_loop() {
        let _guard = sys::fault::lock();
        let shared = Shared::new();
        let ctx = Context::new(shared).unwrap();

        let bind_addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = sys::stream_socket(&bind_addr).unwrap();
        sys::bind(&listener, &bind_addr).unwrap();
        sys::listen(&listener).unwrap();
        let addr = sys::local_addr(&listener).unwrap();

        // Server: accept one connection and read one byte from it.
        let listening = ctx.poller().emplace(listener).unwrap();
        let received = Rc::new(Cell::new(false));
        let flag = received.clone();
        ctx.spawn_accept(&listening, move |ctx, result| {
            let (conn, _peer) = result.unwrap();
            let rctx = ReadContext::new();
            let flag = flag.clone();
            ctx.spawn_recv(&conn, &rctx, move |_ctx, result| {
                let (n, _) = result.unwrap();
                assert_eq!(n, 1);
                flag.set(true);
            });
        });
        drop(listening);

        // Client: connect, then send that byte.
        let client = sys::stream_socket(&bind_addr).unwrap();
        let dialog = ctx.poller().emplace(client).unwrap();
        let connected = Rc::new(Cell::new(false));
        let flag = connected.clone();
        let sender = dialog.clone();
        ctx.spawn_connect(&dialog, addr, move |ctx, result| {
            result.unwrap();
            flag.set(true);
            ctx.spawn_send(&sender, b"x", None, |_ctx, result| {
                result.unwrap();
            });
        });
        drop(dialog);

        ctx.run();
        assert!(connected.get());
        assert!(received.get());
        assert!(ctx.poller().is_empty());
    }

    #[test]
    fn test_request_stop_is_sticky() {
        let shared = Shared::new();
        let ctx = Context::new(shared).unwrap();
        assert!(!ctx.stop_requested());
        ctx.request_stop();
        assert!(ctx.stop_requested());
    }
}
