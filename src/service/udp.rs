//! Asynchronous UDP receiver skeleton.
//!
//! Same shape as the TCP skeleton, simpler: one bound datagram socket,
//! one receive chain. The user's [`DatagramHandler`] replies through the
//! [`DatagramSession`] and re-submits the receive.

use crate::context::{Context, Signal};
use crate::poller::Dialog;
use crate::service::{ReadContext, Service};
use crate::sys;
use parking_lot::Mutex;
use socket2::Socket;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

/// Datagram capability set of a UDP service.
///
/// `service` is invoked with `Some(data)` for every received datagram
/// (empty datagrams arrive as `Some(&[])`, with the sender available
/// from `session.peer()`), and with `None` when the socket is done
/// (receive error, or read-shutdown during terminate).
pub trait DatagramHandler: Send + 'static {
    /// Set extra socket options before `bind`. An error fails startup.
    fn initialize(&mut self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }

    fn service(&mut self, ctx: &Context, session: &DatagramSession, data: Option<&[u8]>);

    /// User-level quiesce, invoked on `Terminate` (possibly repeatedly
    /// under the terminate nudge).
    fn stop(&mut self) {}
}

type Emit = Rc<dyn Fn(&Context, &DatagramSession, Option<&[u8]>)>;

/// The bound datagram socket plus its receive state.
#[derive(Clone)]
pub struct DatagramSession {
    dialog: Dialog,
    rctx: ReadContext,
    emit: Emit,
}

impl DatagramSession {
    fn new<H: DatagramHandler>(dialog: Dialog, handler: Arc<Mutex<H>>) -> Self {
        let emit: Emit =
            Rc::new(move |ctx, session, data| handler.lock().service(ctx, session, data));
        Self {
            dialog,
            rctx: ReadContext::new(),
            emit,
        }
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    pub fn read_context(&self) -> &ReadContext {
        &self.rctx
    }

    /// Source of the most recently received datagram.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.rctx.peer()
    }

    /// Stage the next receive. One receive is in flight per socket.
    ///
    /// A zero-byte read with a source address is a genuine empty
    /// datagram; without one it is the read-shutdown end-of-stream.
    pub fn submit_recv(&self, ctx: &Context) {
        let session = self.clone();
        ctx.spawn_recv(&self.dialog, &self.rctx, move |ctx, result| match result {
            Ok((len, Some(_))) => {
                let rctx = session.rctx.clone();
                rctx.with_data(len, |data| (session.emit)(ctx, &session, Some(data)));
            }
            Ok((_, None)) | Err(_) => (session.emit)(ctx, &session, None),
        });
    }

    /// Stage a datagram send to `dest`.
    pub fn send_to(
        &self,
        ctx: &Context,
        data: &[u8],
        dest: SocketAddr,
        complete: impl FnOnce(&Context, io::Result<usize>) + 'static,
    ) {
        ctx.spawn_send(&self.dialog, data, Some(dest), complete);
    }
}

/// UDP receiver service: binds one datagram socket and feeds received
/// datagrams to the handler.
pub struct UdpService<H> {
    address: SocketAddr,
    handler: Arc<Mutex<H>>,
    socket: AtomicI32,
}

impl<H: DatagramHandler> UdpService<H> {
    pub fn new(address: SocketAddr, handler: H) -> Self {
        Self {
            address,
            handler: Arc::new(Mutex::new(handler)),
            socket: AtomicI32::new(sys::INVALID_SOCKET),
        }
    }

    /// The configured address; reflects the kernel-assigned port once
    /// the service has bound an ephemeral one.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    fn initialize(&mut self, socket: &Socket) -> io::Result<()> {
        sys::set_reuseaddr(socket)?;
        self.handler.lock().initialize(socket)?;
        sys::bind(socket, &self.address)?;
        self.address = sys::local_addr(socket)?;
        Ok(())
    }

    fn half_shutdown(&self) {
        let fd = self.socket.swap(sys::INVALID_SOCKET, Ordering::SeqCst);
        if fd != sys::INVALID_SOCKET {
            sys::shutdown_read(fd);
        }
    }
}

impl<H: DatagramHandler> Service for UdpService<H> {
    fn start(&mut self, ctx: &Context) -> io::Result<()> {
        let socket = sys::datagram_socket(&self.address)?;
        self.initialize(&socket)?;

        self.socket.store(sys::raw_fd(&socket), Ordering::SeqCst);

        let dialog = ctx.poller().emplace(socket)?;
        let session = DatagramSession::new(dialog, self.handler.clone());
        session.submit_recv(ctx);
        tracing::debug!(address = %self.address, "udp service bound");
        Ok(())
    }

    fn signal_handler(&mut self, signal: Signal) {
        if signal == Signal::Terminate {
            self.handler.lock().stop();
            self.half_shutdown();
        }
    }
}
