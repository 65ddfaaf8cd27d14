//! The readiness multiplexer: poll loop, socket registry, and dispatch.

use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::handle::SocketHandle;
use crate::handler::SocketHandler;
use crate::socket::{ManagedSocket, SocketShared};
use crate::timer::TimerWheel;
use crate::types::SocketId;

/// Token reserved for the cross-thread waker, offset far above any
/// registry slot to avoid collision with socket tokens.
const WAKER_TOKEN: Token = Token(1 << 30);

/// Multiplexer state reachable from foreign threads via [`SocketHandle`].
///
/// Everything here is lock-per-structure; the loop thread takes the same
/// locks briefly at the top of each iteration. No user code runs while
/// either lock is held.
pub(crate) struct MuxShared {
    waker: Waker,
    timers: Mutex<TimerWheel>,
    pending_close: Mutex<Vec<SocketId>>,
}

impl MuxShared {
    /// Wake a blocked poll so the next iteration observes queue, timer,
    /// or close-request changes made by a foreign thread.
    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "failed to wake poll");
        }
    }

    pub(crate) fn lock_timers(&self) -> MutexGuard<'_, TimerWheel> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_pending_close(&self) -> MutexGuard<'_, Vec<SocketId>> {
        self.pending_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The event loop: owns the OS readiness mechanism and the socket registry.
///
/// Driven externally, one [`wait`](Multiplexer::wait) call per iteration.
pub(crate) struct Multiplexer {
    poll: Poll,
    events: Events,
    sockets: Slab<ManagedSocket>,
    /// Raw fd of every live registration, for duplicate detection.
    fds: HashMap<RawFd, usize>,
    shared: Arc<MuxShared>,
    read_buf: Vec<u8>,
    next_generation: u32,
    max_sockets: usize,
    shut: bool,
}

impl Multiplexer {
    pub(crate) fn new(
        event_capacity: usize,
        read_buffer_size: usize,
        max_sockets: usize,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(event_capacity),
            sockets: Slab::with_capacity(max_sockets.min(4096)),
            fds: HashMap::new(),
            shared: Arc::new(MuxShared {
                waker,
                timers: Mutex::new(TimerWheel::new()),
                pending_close: Mutex::new(Vec::new()),
            }),
            read_buf: vec![0u8; read_buffer_size],
            next_generation: 0,
            max_sockets,
            shut: false,
        })
    }

    /// Wrap `stream` and add it to the registry, armed for readability.
    /// Writable interest is demand-driven: it is only requested while the
    /// socket has queued bytes.
    pub(crate) fn register(
        &mut self,
        stream: TcpStream,
        handler: Box<dyn SocketHandler>,
    ) -> Result<SocketHandle> {
        if self.shut {
            return Err(Error::ShutDown);
        }
        if self.sockets.len() >= self.max_sockets {
            return Err(Error::SocketLimitReached);
        }
        let fd = stream.as_raw_fd();
        if self.fds.contains_key(&fd) {
            // The fd aliases a live registration; dropping the duplicate
            // would close it out from under the original owner.
            let _ = stream.into_raw_fd();
            return Err(Error::AlreadyRegistered(fd));
        }
        stream.set_nonblocking(true)?;
        let mut stream = MioTcpStream::from_std(stream);

        let entry = self.sockets.vacant_entry();
        let slot = entry.key();
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        self.poll
            .registry()
            .register(&mut stream, Token(slot), Interest::READABLE)?;

        let shared = Arc::new(SocketShared::new());
        let id = SocketId::new(slot, generation);
        entry.insert(ManagedSocket::new(
            stream,
            shared.clone(),
            handler,
            generation,
            fd,
        ));
        self.fds.insert(fd, slot);
        debug!(fd, id = id.as_u64(), "socket registered");

        Ok(SocketHandle::new(id, shared, Arc::clone(&self.shared)))
    }

    /// Run one loop iteration: apply pending closes, fire due timers,
    /// re-sync interest, block for readiness up to the effective timeout,
    /// and dispatch events. Returns the number of socket events handled.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> Result<usize> {
        if self.shut {
            return Err(Error::ShutDown);
        }
        self.apply_pending_closes();

        let now = Instant::now();
        self.fire_due_timers(now);

        let timeout = self.effective_timeout(timeout, now);
        self.sync_interest();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        // Collect event info first: dispatch mutates the registry.
        let batch: Vec<(usize, bool, bool, bool, bool)> = self
            .events
            .iter()
            .filter(|e| e.token() != WAKER_TOKEN)
            .map(|e| {
                (
                    e.token().0,
                    e.is_readable(),
                    e.is_writable(),
                    e.is_read_closed() || e.is_write_closed(),
                    e.is_error(),
                )
            })
            .collect();

        let dispatched = batch.len();
        for (slot, readable, writable, closed, error) in batch {
            self.dispatch(slot, readable, writable, closed, error);
        }
        Ok(dispatched)
    }

    /// Tear down every live socket with a forced failure notification,
    /// then empty the registry and the timer wheel. Terminal: the
    /// multiplexer rejects registration and waiting afterwards.
    pub(crate) fn shutdown(&mut self) {
        if self.shut {
            return;
        }
        self.shut = true;
        self.shared.lock_timers().clear();
        self.shared.lock_pending_close().clear();
        self.fds.clear();

        let sockets: Vec<ManagedSocket> = self.sockets.drain().collect();
        for mut sock in sockets {
            sock.shared.mark_closed();
            let _ = self.poll.registry().deregister(sock.stream_mut());
            sock.notify_failure();
        }
        debug!("multiplexer shut down");
    }

    pub(crate) fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut
    }

    /// Voluntary closes requested through handles since the last iteration.
    fn apply_pending_closes(&mut self) {
        let pending = mem::take(&mut *self.shared.lock_pending_close());
        for id in pending {
            let slot = id.slot();
            let live = self
                .sockets
                .get(slot)
                .map(|s| s.generation == id.generation())
                .unwrap_or(false);
            if live {
                self.remove_socket_quiet(slot);
            }
        }
    }

    fn fire_due_timers(&mut self, now: Instant) {
        // Pop before invoking: a callback may schedule new timers, and the
        // lock must not be held while user code runs.
        let due = self.shared.lock_timers().pop_expired(now);
        for callback in due {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                warn!("timer callback panicked; continuing");
            }
        }
    }

    /// The poll timeout: the caller's bound, shortened so the next timer
    /// deadline is never slept past.
    fn effective_timeout(&self, caller: Option<Duration>, now: Instant) -> Option<Duration> {
        let until_next = self
            .shared
            .lock_timers()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        match (caller, until_next) {
            (None, None) => None,
            (Some(t), None) => Some(t),
            (None, Some(u)) => Some(u),
            (Some(t), Some(u)) => Some(t.min(u)),
        }
    }

    /// Bring the OS-registered interest of every socket in line with its
    /// current send-queue state. Registry and OS interest must never
    /// diverge; this pass runs every iteration so writable interest
    /// appears when bytes are queued and disappears once drained.
    fn sync_interest(&mut self) {
        let mut failed = Vec::new();
        for (slot, sock) in self.sockets.iter_mut() {
            let desired = sock.desired_interest();
            if desired != sock.interest {
                match self
                    .poll
                    .registry()
                    .reregister(sock.stream_mut(), Token(slot), desired)
                {
                    Ok(()) => sock.interest = desired,
                    Err(e) => {
                        warn!(fd = sock.fd, error = %e, "interest re-arm failed");
                        failed.push(slot);
                    }
                }
            }
        }
        for slot in failed {
            self.fail_socket(slot, "interest re-arm failed");
        }
    }

    fn dispatch(&mut self, slot: usize, readable: bool, writable: bool, closed: bool, error: bool) {
        let voluntarily_closed = match self.sockets.get(slot) {
            None => return, // failed or closed earlier in this batch
            Some(sock) => sock.shared.is_closed(),
        };
        if voluntarily_closed {
            // close() raced the readiness report; honor the close.
            self.remove_socket_quiet(slot);
            return;
        }

        if error {
            self.fail_socket(slot, "error reported by poll");
            return;
        }

        if readable {
            let result = match self.sockets.get_mut(slot) {
                Some(sock) => sock.on_readable(&mut self.read_buf),
                None => return,
            };
            if let Err(e) = result {
                trace!(error = %e, "read failed");
                self.fail_socket(slot, "read failure");
                return;
            }
        }

        if writable {
            let result = match self.sockets.get_mut(slot) {
                Some(sock) => sock.drain_on_writable(),
                None => return,
            };
            if let Err(e) = result {
                trace!(error = %e, "write failed");
                self.fail_socket(slot, "write failure");
                return;
            }
        }

        if closed && self.sockets.contains(slot) {
            self.fail_socket(slot, "peer hangup");
        }
    }

    /// Terminal failure path: remove the socket everywhere, cancel its
    /// timers, notify the handler exactly once, and close the fd.
    fn fail_socket(&mut self, slot: usize, reason: &str) {
        let Some(mut sock) = self.sockets.try_remove(slot) else {
            return;
        };
        self.fds.remove(&sock.fd);
        // Closed-before-cancel ordering: a concurrent oneshot() checks the
        // closed flag under the timer lock, so it either sees the flag or
        // its entry is removed by this cancel_all.
        sock.shared.mark_closed();
        let id = SocketId::new(slot, sock.generation);
        self.shared.lock_timers().cancel_all(id);
        let _ = self.poll.registry().deregister(sock.stream_mut());
        debug!(fd = sock.fd, reason, "socket failed");
        sock.notify_failure();
    }

    /// Voluntary removal: same bookkeeping as failure, without the
    /// failure notification.
    fn remove_socket_quiet(&mut self, slot: usize) {
        let Some(mut sock) = self.sockets.try_remove(slot) else {
            return;
        };
        self.fds.remove(&sock.fd);
        sock.shared.mark_closed();
        let id = SocketId::new(slot, sock.generation);
        self.shared.lock_timers().cancel_all(id);
        let _ = self.poll.registry().deregister(sock.stream_mut());
        trace!(fd = sock.fd, "socket closed");
    }
}
