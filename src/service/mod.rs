//! User service surface: the capability trait consumed by the host and
//! the shared read context handed along receive chains.

pub mod tcp;
pub mod udp;

use crate::context::{Context, Signal};
use crate::sys;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// A service hosted on an event loop.
///
/// `start` runs once on the loop thread after the interrupt service
/// routine is installed; it binds sockets and stages the service's
/// initial operations. Returning an error aborts startup: the host
/// raises `Terminate`, drains the loop, and surfaces the error to the
/// caller of `ServiceHost::start`.
pub trait Service: Send + 'static {
    fn start(&mut self, ctx: &Context) -> io::Result<()>;

    /// Out-of-band signal delivery from the interrupt service routine.
    /// Runs on the loop thread. Under a terminate nudge this may be
    /// invoked repeatedly; implementations must tolerate that.
    fn signal_handler(&mut self, signal: Signal);
}

/// Receive buffer size per connection or datagram socket.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

struct ReadContextInner {
    buffer: Box<[u8]>,
    peer: Option<SocketAddr>,
}

/// Per-connection (or per-datagram-socket) receive state: a fixed
/// buffer and the source address of the last datagram.
///
/// Clones share one buffer. The in-flight receive and any continuation
/// the handler stages each hold a clone; the state is released when the
/// last one drops.
#[derive(Clone)]
pub struct ReadContext {
    inner: Rc<RefCell<ReadContextInner>>,
}

impl ReadContext {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ReadContextInner {
                buffer: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
                peer: None,
            })),
        }
    }

    /// Source address of the most recent datagram, if any.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.borrow().peer
    }

    /// Receive once from `fd` into the buffer. Returns the byte count
    /// and the source of this particular read.
    pub(crate) fn fill_from(&self, fd: RawFd) -> io::Result<(usize, Option<SocketAddr>)> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let (n, source) = sys::recv_from(fd, &mut inner.buffer)?;
        if source.is_some() {
            inner.peer = source;
        }
        Ok((n, source))
    }

    /// Borrow the first `len` bytes of the buffer.
    pub(crate) fn with_data<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.borrow();
        f(&inner.buffer[..len])
    }
}

impl Default for ReadContext {
    fn default() -> Self {
        Self::new()
    }
}
