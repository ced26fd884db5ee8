//! netloop - single-threaded readiness event loop with timers and a
//! thread-binding service host.
//!
//! Each [`ServiceHost`] binds one user service to one operating-system
//! thread. That thread multiplexes socket readiness, resolves timers,
//! drains an out-of-band signal mailbox, and drives the service's
//! continuation chains until the loop runs dry - shutdown is a drain,
//! not a kill.
//!
//! # Quick Start
//!
//! ```no_run
//! use netloop::{Context, ServiceHost, Signal, StreamHandler, StreamSession, TcpService};
//!
//! struct Echo;
//!
//! impl StreamHandler for Echo {
//!     fn service(&mut self, ctx: &Context, session: &StreamSession, data: Option<&[u8]>) {
//!         match data {
//!             // Connection closed: stage nothing, the connection drops.
//!             None => {}
//!             // Fresh connection: stage the first read.
//!             Some([]) => session.submit_recv(ctx),
//!             // Echo, then read again.
//!             Some(data) => {
//!                 let next = session.clone();
//!                 session.send(ctx, data, move |ctx, result| {
//!                     if result.is_ok() {
//!                         next.submit_recv(ctx);
//!                     }
//!                 });
//!             }
//!         }
//!     }
//! }
//!
//! let mut host = ServiceHost::new();
//! let addr = "127.0.0.1:7000".parse().unwrap();
//! host.start(move || TcpService::new(addr, Echo)).unwrap();
//!
//! // The service is bound and listening as soon as start returns.
//! // ... connect clients ...
//!
//! host.signal(Signal::Terminate); // drained and joined on drop
//! ```
//!
//! # Threading model
//!
//! Everything a service does happens on its loop thread. Exactly three
//! surfaces are safe to touch from outside: [`ServiceHost::signal`] (and
//! [`Context::signal`]), [`Context::interrupt`], and the [`TimerWheel`].
//! Timer handlers run on the loop thread but must be `Send`, since they
//! may be installed from any thread.

mod context;
mod error;
mod host;
mod poller;
pub mod service;
mod sys;
mod timer;
mod wakeup;

pub use context::{Context, Signal};
pub use error::Error;
pub use host::{LifecycleState, ServiceHost};
pub use poller::{Dialog, Poller};
pub use service::tcp::{StreamHandler, StreamSession, TcpService};
pub use service::udp::{DatagramHandler, DatagramSession, UdpService};
pub use service::{READ_BUFFER_SIZE, ReadContext, Service};
pub use timer::{INVALID_TIMER, TimerId, TimerWheel};
