//! Readiness multiplexer built on mio (epoll/kqueue).

use crate::sys;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::Socket;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// One readiness record from a poll pass, copied out of the mio event
/// buffer before dispatch so handlers may register and deregister freely.
pub(crate) struct PollEvent {
    pub(crate) token: usize,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) closed: bool,
    pub(crate) error: bool,
}

struct PollerInner {
    poll: Poll,
    events: Events,
    sources: Slab<RawFd>,
}

/// Owns the poll instance and the registration table.
///
/// Descriptors are registered through [`emplace`], which returns a
/// [`Dialog`]; the registration lives exactly as long as the dialog does.
///
/// [`emplace`]: Poller::emplace
pub struct Poller {
    inner: Rc<RefCell<PollerInner>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Rc::new(RefCell::new(PollerInner {
                poll: Poll::new()?,
                events: Events::with_capacity(1024),
                sources: Slab::new(),
            })),
        })
    }

    /// Register an owned socket. The returned dialog closes it on drop.
    pub fn emplace(&self, socket: Socket) -> io::Result<Dialog> {
        self.emplace_raw(socket.into_raw_fd())
    }

    /// Register a raw descriptor, taking ownership of it.
    pub(crate) fn emplace_raw(&self, fd: RawFd) -> io::Result<Dialog> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        let entry = inner.sources.vacant_entry();
        let token = entry.key();
        if let Err(err) = inner.poll.registry().register(
            &mut SourceFd(&fd),
            Token(token),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            sys::close(fd);
            return Err(err);
        }
        entry.insert(fd);

        Ok(Dialog {
            inner: Rc::new(DialogInner {
                token,
                fd,
                poller: Rc::downgrade(&self.inner),
            }),
        })
    }

    /// Block until readiness or `timeout` (`None` blocks indefinitely).
    /// Returns immediately when nothing is registered.
    pub(crate) fn wait_for(&self, timeout: Option<Duration>) -> io::Result<Vec<PollEvent>> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        if inner.sources.is_empty() {
            return Ok(Vec::new());
        }

        loop {
            match inner.poll.poll(&mut inner.events, timeout) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(inner
            .events
            .iter()
            .map(|event| PollEvent {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_read_closed() || event.is_write_closed(),
                error: event.is_error(),
            })
            .collect())
    }

    /// True when no live dialogs remain registered.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().sources.is_empty()
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        self.inner.borrow().sources.len()
    }
}

struct DialogInner {
    token: usize,
    fd: RawFd,
    poller: Weak<RefCell<PollerInner>>,
}

/// A shared handle to a descriptor registered with the multiplexer.
///
/// Clones are cheap; the descriptor is deregistered and closed when the
/// last clone drops. Continuation chains keep the dialog of the socket
/// they operate on alive by holding a clone.
#[derive(Clone)]
pub struct Dialog {
    inner: Rc<DialogInner>,
}

impl Dialog {
    pub fn raw_fd(&self) -> RawFd {
        self.inner.fd
    }

    pub(crate) fn token(&self) -> usize {
        self.inner.token
    }
}

impl Drop for DialogInner {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.upgrade() {
            let mut inner = poller.borrow_mut();
            if inner.sources.contains(self.token) {
                inner.sources.remove(self.token);
            }
            let _ = inner.poll.registry().deregister(&mut SourceFd(&self.fd));
        }
        sys::close(self.fd);
    }
}
