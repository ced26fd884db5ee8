//! One-byte self-pipe used to poke a blocked multiplexer.

use crate::sys;
use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

/// Paired stream endpoints with a single writer role (anyone signaling)
/// and a single reader role (the loop's interrupt service routine).
///
/// The endpoints are stored as raw descriptors behind atomics so that
/// `interrupt` stays callable from any thread and teardown is idempotent.
/// The reader is handed off to a poller dialog with [`take_reader`] and
/// closed by that dialog; closing the writer is the explicit signal to the
/// reader that no further interrupts are coming.
///
/// [`take_reader`]: WakeupChannel::take_reader
pub(crate) struct WakeupChannel {
    reader: AtomicI32,
    writer: AtomicI32,
}

impl WakeupChannel {
    pub(crate) const fn new() -> Self {
        Self {
            reader: AtomicI32::new(sys::INVALID_SOCKET),
            writer: AtomicI32::new(sys::INVALID_SOCKET),
        }
    }

    /// Open a fresh socketpair, replacing (and closing) any previous one.
    pub(crate) fn open(&self) -> io::Result<()> {
        let (reader, writer) = sys::socket_pair()?;
        self.close_reader();
        self.close_writer();
        self.reader.store(reader.into_raw_fd(), Ordering::SeqCst);
        self.writer.store(writer.into_raw_fd(), Ordering::SeqCst);
        Ok(())
    }

    /// Transfer ownership of the read end to the caller.
    pub(crate) fn take_reader(&self) -> RawFd {
        self.reader.swap(sys::INVALID_SOCKET, Ordering::SeqCst)
    }

    /// Make the read end readable. A full pipe means a wake is already
    /// pending, so the failed write is ignored.
    pub(crate) fn interrupt(&self) {
        let fd = self.writer.load(Ordering::SeqCst);
        if fd != sys::INVALID_SOCKET {
            let _ = sys::send(fd, b"x");
        }
    }

    pub(crate) fn close_writer(&self) {
        let fd = self.writer.swap(sys::INVALID_SOCKET, Ordering::SeqCst);
        if fd != sys::INVALID_SOCKET {
            sys::close(fd);
        }
    }

    pub(crate) fn close_reader(&self) {
        let fd = self.reader.swap(sys::INVALID_SOCKET, Ordering::SeqCst);
        if fd != sys::INVALID_SOCKET {
            sys::close(fd);
        }
    }

    /// Exchange endpoints with another channel. Callers serialize; the
    /// timer wheel holds both state locks while swapping.
    pub(crate) fn swap(&self, other: &WakeupChannel) {
        for (a, b) in [(&self.reader, &other.reader), (&self.writer, &other.writer)] {
            let tmp = a.load(Ordering::SeqCst);
            a.store(b.load(Ordering::SeqCst), Ordering::SeqCst);
            b.store(tmp, Ordering::SeqCst);
        }
    }
}

impl Drop for WakeupChannel {
    fn drop(&mut self) {
        self.close_reader();
        self.close_writer();
    }
}
