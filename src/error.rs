//! Crate error type.

use std::io;

/// Errors surfaced by the service host.
///
/// Steady-state I/O errors never reach this type; they are funneled into
/// the end-of-stream path of the affected connection. Only lifecycle
/// operations report here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `start` was called on a host that already left the pending state.
    #[error("service host already started")]
    AlreadyStarted,

    /// The user service's `start` hook failed on the loop thread.
    #[error("service failed to start: {0}")]
    ServiceInit(#[source] io::Error),

    /// A host-side system call failed (e.g. the wakeup socketpair).
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
