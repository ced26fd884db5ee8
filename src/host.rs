//! Thread-binding service host.
//!
//! A [`ServiceHost`] owns one loop thread. `start` constructs the user
//! service on that thread, installs the interrupt service routine on the
//! wakeup channel, runs the service's `start` hook, and only returns to
//! the caller once the service is up (or has failed) — so a caller may
//! connect to the service's port the moment `start` returns.

use crate::context::{Context, Shared, Signal, SignalSet};
use crate::error::Error;
use crate::poller::Dialog;
use crate::service::Service;
use crate::sys;
use crate::timer::TimerWheel;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One-way host lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Pending,
    Started,
    Stopped,
}

/// Notified lifecycle cell; external callers block on transitions.
pub(crate) struct Lifecycle {
    state: Mutex<LifecycleState>,
    cond: Condvar,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Pending),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn current(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Move forward to `to`; transitions never go backwards.
    pub(crate) fn advance(&self, to: LifecycleState) {
        let mut state = self.state.lock();
        if *state < to {
            *state = to;
            self.cond.notify_all();
        }
    }

    pub(crate) fn wait_while(&self, current: LifecycleState) -> LifecycleState {
        let mut state = self.state.lock();
        self.cond.wait_while(&mut state, |state| *state == current);
        *state
    }
}

/// Owns the loop thread and the user service running on it.
///
/// ```no_run
/// use netloop::{ServiceHost, Signal, TcpService};
/// # use netloop::{Context, StreamHandler, StreamSession};
/// # struct Echo;
/// # impl StreamHandler for Echo {
/// #     fn service(&mut self, _: &Context, _: &StreamSession, _: Option<&[u8]>) {}
/// # }
///
/// let mut host = ServiceHost::new();
/// let addr = "127.0.0.1:9000".parse().unwrap();
/// host.start(move || TcpService::new(addr, Echo)).unwrap();
/// // ... the service is bound and listening here ...
/// host.signal(Signal::Terminate);
/// ```
pub struct ServiceHost {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            shared: Shared::new(),
            thread: None,
        }
    }

    /// Start the service loop. Blocks until the service's `start` hook
    /// has completed on the loop thread.
    ///
    /// The factory runs on the loop thread, so the service itself never
    /// crosses threads. Errors from the service's `start` hook surface
    /// here as [`Error::ServiceInit`] after the loop has drained.
    pub fn start<S, F>(&mut self, factory: F) -> Result<(), Error>
    where
        S: Service,
        F: FnOnce() -> S + Send + 'static,
    {
        if self.shared.lifecycle.current() != LifecycleState::Pending {
            return Err(Error::AlreadyStarted);
        }

        // A socketpair failure leaves the host pending; start may be
        // retried.
        self.shared.timers.wakeup().open()?;

        let shared = self.shared.clone();
        self.thread = Some(
            thread::Builder::new()
                .name("netloop".to_string())
                .spawn(move || run_loop(shared, factory))?,
        );

        self.shared.lifecycle.wait_while(LifecycleState::Pending);
        match self.shared.take_startup_error() {
            Some(err) => Err(Error::ServiceInit(err)),
            None => Ok(()),
        }
    }

    /// Raise `signal` on the loop. Thread-safe.
    pub fn signal(&self, signal: Signal) {
        self.shared.raise(signal);
    }

    /// The loop's timer wheel; safe to use from any thread.
    pub fn timers(&self) -> &TimerWheel {
        &self.shared.timers
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.current()
    }

    /// Block while the lifecycle equals `current`; returns the new state.
    pub fn wait_while(&self, current: LifecycleState) -> LifecycleState {
        self.shared.lifecycle.wait_while(current)
    }

    /// Raise `Terminate` and join the loop thread. Idempotent.
    pub fn stop(&mut self) {
        if self.shared.lifecycle.current() > LifecycleState::Pending {
            self.signal(Signal::Terminate);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Body of the loop thread.
fn run_loop<S, F>(shared: Arc<Shared>, factory: F)
where
    S: Service,
    F: FnOnce() -> S,
{
    let reader = shared.timers.wakeup().take_reader();

    let ctx = match Context::new(shared.clone()) {
        Ok(ctx) => ctx,
        Err(err) => {
            sys::close(reader);
            return fail_startup(&shared, err);
        }
    };

    let service = Arc::new(Mutex::new(factory()));

    let dialog = match ctx.poller().emplace_raw(reader) {
        Ok(dialog) => dialog,
        Err(err) => return fail_startup(&shared, err),
    };
    install_isr(&ctx, dialog, service.clone());

    let started = service.lock().start(&ctx);
    match started {
        Ok(()) => {
            tracing::debug!("service started");
            shared.lifecycle.advance(LifecycleState::Started);
        }
        Err(err) => {
            tracing::error!("service failed to start: {err}");
            shared.record_startup_error(err);
            ctx.signal(Signal::Terminate);
        }
    }

    ctx.run();

    // No further interrupts are coming.
    shared.timers.wakeup().close_writer();
    shared.lifecycle.advance(LifecycleState::Stopped);
    tracing::debug!("service loop stopped");
}

fn fail_startup(shared: &Arc<Shared>, err: io::Error) {
    tracing::error!("loop thread failed before the service ran: {err}");
    shared.record_startup_error(err);
    shared.timers.wakeup().close_writer();
    shared.lifecycle.advance(LifecycleState::Stopped);
}

/// The canonical interrupt service routine: drain the mailbox, hand each
/// bit to the service, and on `Terminate` request scope stop plus a
/// periodic one-second nudge that keeps poking the service until the
/// loop drains.
fn install_isr<S: Service>(ctx: &Context, dialog: Dialog, service: Arc<Mutex<S>>) {
    let shared = ctx.shared().clone();
    ctx.isr(dialog, move || {
        let pending = shared.take_signals();
        for signal in pending.signals() {
            service.lock().signal_handler(signal);
        }

        if pending.contains(SignalSet::TERMINATE) {
            shared.stop.store(true, Ordering::SeqCst);
            let nudge = service.clone();
            shared
                .timers
                .add_periodic(Duration::from_secs(1), Duration::from_secs(1), move |_| {
                    nudge.lock().signal_handler(Signal::Terminate);
                });
        }

        !shared.stop.load(Ordering::SeqCst)
    });
}
