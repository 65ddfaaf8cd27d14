//! Per-socket buffered non-blocking I/O.

use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use mio::Interest;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use crate::handler::SocketHandler;

/// Outbound bytes awaiting transmission.
///
/// Two FIFO queues of chunks: the priority queue drains fully before the
/// normal queue. A partially written chunk stays at the front of its queue.
pub(crate) struct SendQueue {
    priority: VecDeque<Bytes>,
    normal: VecDeque<Bytes>,
    closed: bool,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            priority: VecDeque::new(),
            normal: VecDeque::new(),
            closed: false,
        }
    }

    fn front_mut(&mut self) -> Option<&mut Bytes> {
        if !self.priority.is_empty() {
            self.priority.front_mut()
        } else {
            self.normal.front_mut()
        }
    }

    fn pop_front(&mut self) {
        if !self.priority.is_empty() {
            self.priority.pop_front();
        } else {
            self.normal.pop_front();
        }
    }

    fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }
}

/// The slice of per-socket state that foreign threads may touch.
///
/// Shared between the loop-owned [`ManagedSocket`] and every clone of the
/// caller's [`SocketHandle`](crate::SocketHandle). All access goes through
/// one mutex; no user code ever runs while it is held, so the
/// poison-recovery on lock is unreachable in practice.
pub(crate) struct SocketShared {
    sendq: Mutex<SendQueue>,
}

impl SocketShared {
    pub(crate) fn new() -> Self {
        Self {
            sendq: Mutex::new(SendQueue::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SendQueue> {
        self.sendq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `data` to the chosen queue. Returns whether bytes were
    /// queued: false once the socket is closed (send on a dead socket is a
    /// no-op) or when `data` is empty.
    pub(crate) fn push(&self, data: &[u8], priority: bool) -> bool {
        if data.is_empty() {
            return false;
        }
        let mut q = self.lock();
        if q.closed {
            return false;
        }
        let chunk = Bytes::copy_from_slice(data);
        if priority {
            q.priority.push_back(chunk);
        } else {
            q.normal.push_back(chunk);
        }
        true
    }

    /// True iff either queue is non-empty.
    pub(crate) fn wants_to_write(&self) -> bool {
        !self.lock().is_empty()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Mark the socket closed and discard queued bytes. Idempotent;
    /// returns true on the first transition.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut q = self.lock();
        if q.closed {
            return false;
        }
        q.closed = true;
        q.priority.clear();
        q.normal.clear();
        true
    }
}

/// One registered socket: the OS stream, its shared send state, and the
/// caller's handler. Owned by the multiplexer's registry.
pub(crate) struct ManagedSocket {
    stream: TcpStream,
    pub(crate) shared: Arc<SocketShared>,
    handler: Box<dyn SocketHandler>,
    pub(crate) generation: u32,
    pub(crate) fd: RawFd,
    /// Interest currently registered with the poll, kept in sync by the
    /// loop's per-iteration interest pass.
    pub(crate) interest: Interest,
}

impl ManagedSocket {
    pub(crate) fn new(
        stream: TcpStream,
        shared: Arc<SocketShared>,
        handler: Box<dyn SocketHandler>,
        generation: u32,
        fd: RawFd,
    ) -> Self {
        Self {
            stream,
            shared,
            handler,
            generation,
            fd,
            interest: Interest::READABLE,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// The interest this socket should be registered for right now:
    /// readable always, writable only while there are bytes to send.
    pub(crate) fn desired_interest(&self) -> Interest {
        if self.shared.wants_to_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Read until the OS has no more data, delivering each chunk to the
    /// handler. Readiness is edge-triggered, so stopping before
    /// `WouldBlock` would lose the rest of the data until the next edge.
    ///
    /// An `Err` return means the socket is no longer usable (EOF or OS
    /// error) and must take the failure path.
    pub(crate) fn on_readable(&mut self, buf: &mut [u8]) -> io::Result<()> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ));
                }
                Ok(n) => {
                    let handler = &mut self.handler;
                    let chunk = &buf[..n];
                    if panic::catch_unwind(AssertUnwindSafe(|| handler.handle_read(chunk))).is_err()
                    {
                        warn!(fd = self.fd, "read handler panicked; continuing");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write queued bytes until both queues are empty or the OS pushes
    /// back. Partially accepted chunks keep their unwritten tail at the
    /// front of the queue.
    pub(crate) fn drain_on_writable(&mut self) -> io::Result<()> {
        let mut q = self.shared.lock();
        loop {
            let Some(chunk) = q.front_mut() else {
                return Ok(());
            };
            match self.stream.write(chunk.as_ref()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) if n == chunk.len() => q.pop_front(),
                Ok(n) => chunk.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Invoke the failure callback, isolating panics.
    pub(crate) fn notify_failure(&mut self) {
        let handler = &mut self.handler;
        if panic::catch_unwind(AssertUnwindSafe(|| handler.handle_failure())).is_err() {
            warn!(fd = self.fd, "failure handler panicked");
        }
    }
}
