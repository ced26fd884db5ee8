//! Asynchronous TCP acceptor and per-connection stream skeleton.
//!
//! [`TcpService`] owns the listening socket lifecycle and the accept
//! chain; the user supplies a [`StreamHandler`] that reacts to reads and
//! drives each connection by staging work through its [`StreamSession`].

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

/// Per-connection capability set of a TCP service.
///
/// `service` is invoked with:
/// - `Some(&[])` once per connection, right after accept — stage the
///   first read (by convention, `session.submit_recv`);
/// - `Some(data)` for every successful non-empty read;
/// - `None` when the stream ended (peer EOF or read error) — the
///   connection closes once the handler stops staging work for it.
pub trait StreamHandler: Send + 'static {
    /// Set extra socket options on the listening socket, after creation
    /// and before `bind`. An error fails service startup.
    fn initialize(&mut self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }

    fn service(&mut self, ctx: &Context, session: &StreamSession, data: Option<&[u8]>);

    /// User-level quiesce, invoked on `Terminate` (possibly repeatedly
    /// under the terminate nudge).
    fn stop(&mut self) {}
}

type Emit = Rc<dyn Fn(&Context, &StreamSession, Option<&[u8]>)>;

/// One accepted connection: the registered dialog, the shared read
/// context, and the way back into the handler.
///
/// Clones share the connection. The connection stays open exactly as
/// long as a session clone (usually inside a staged operation) is alive.
#[derive(Clone)]
pub struct StreamSession {
    dialog: Dialog,
    rctx: ReadContext,
    emit: Emit,
}

impl StreamSession {
    fn new<H: StreamHandler>(dialog: Dialog, handler: Arc<Mutex<H>>) -> Self {
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

    /// Stage the next read. One read is in flight per connection.
    pub fn submit_recv(&self, ctx: &Context) {
        let session = self.clone();
        ctx.spawn_recv(&self.dialog, &self.rctx, move |ctx, result| match result {
            Ok((0, _)) | Err(_) => (session.emit)(ctx, &session, None),
            Ok((len, _)) => {
                let rctx = session.rctx.clone();
                rctx.with_data(len, |data| (session.emit)(ctx, &session, Some(data)));
            }
        });
    }

    /// Stage a write on the connection.
    pub fn send(
        &self,
        ctx: &Context,
        data: &[u8],
        complete: impl FnOnce(&Context, io::Result<usize>) + 'static,
    ) {
        ctx.spawn_send(&self.dialog, data, None, complete);
    }
}

/// TCP acceptor service: binds and listens on one address, accepts
/// connections, and hands each one to the stream handler.
pub struct TcpService<H> {
    address: SocketAddr,
    handler: Arc<Mutex<H>>,
    listener: AtomicI32,
}

impl<H: StreamHandler> TcpService<H> {
    pub fn new(address: SocketAddr, handler: H) -> Self {
        Self {
            address,
            handler: Arc::new(Mutex::new(handler)),
            listener: AtomicI32::new(sys::INVALID_SOCKET),
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
        sys::listen(socket)?;
        Ok(())
    }

    fn half_shutdown(&self) {
        let fd = self.listener.swap(sys::INVALID_SOCKET, Ordering::SeqCst);
        if fd != sys::INVALID_SOCKET {
            sys::shutdown_read(fd);
        }
    }
}

/// The accept chain: accept one connection, let the handler stage its
/// first read, re-spawn. Accept errors mean the listening socket was
/// closed or interrupted; the chain drops and the scope drains.
fn acceptor<H: StreamHandler>(ctx: &Context, dialog: Dialog, handler: Arc<Mutex<H>>) {
    let listener = dialog.clone();
    ctx.spawn_accept(&dialog, move |ctx, result| match result {
        Ok((conn, peer)) => {
            tracing::trace!(%peer, "accepted connection");
            let session = StreamSession::new(conn, handler.clone());
            (session.emit)(ctx, &session, Some(&[]));
            acceptor(ctx, listener, handler);
        }
        Err(err) => {
            tracing::debug!("accept chain closed: {err}");
        }
    });
}

impl<H: StreamHandler> Service for TcpService<H> {
    fn start(&mut self, ctx: &Context) -> io::Result<()> {
        let socket = sys::stream_socket(&self.address)?;
        self.initialize(&socket)?;

        // Recorded so the signal handler can half-shut it; ownership
        // stays with the dialog.
        self.listener.store(sys::raw_fd(&socket), Ordering::SeqCst);

        let dialog = ctx.poller().emplace(socket)?;
        acceptor(ctx, dialog, self.handler.clone());
        tracing::debug!(address = %self.address, "tcp service listening");
        Ok(())
    }

    fn signal_handler(&mut self, signal: Signal) {
        if signal == Signal::Terminate {
            self.handler.lock().stop();
            self.half_shutdown();
        }
    }
}
