//! Caller-facing handle for one registered socket.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::mux::MuxShared;
use crate::socket::SocketShared;
use crate::types::SocketId;

/// Handle to a registered socket.
///
/// Cloneable and thread-safe: every operation may be called from any
/// thread, concurrently with the loop thread's
/// [`wait`](crate::Listener::wait). Operations on a socket that has
/// already failed, been closed, or been torn down by shutdown degrade to
/// silent no-ops — by the time a caller's data arrives the socket may have
/// failed asynchronously, and the caller should not have to special-case
/// that race.
#[derive(Clone)]
pub struct SocketHandle {
    id: SocketId,
    shared: Arc<SocketShared>,
    mux: Arc<MuxShared>,
}

impl SocketHandle {
    pub(crate) fn new(id: SocketId, shared: Arc<SocketShared>, mux: Arc<MuxShared>) -> Self {
        Self { id, shared, mux }
    }

    /// This socket's identity.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Queue `data` for transmission. Never blocks: bytes are buffered
    /// until the OS reports the socket writable.
    pub fn send(&self, data: &[u8]) {
        self.enqueue(data, false);
    }

    /// Queue `data` ahead of all normally queued bytes. Priority chunks
    /// are transmitted fully before normal ones; within each class, order
    /// of submission is preserved.
    pub fn send_priority(&self, data: &[u8]) {
        self.enqueue(data, true);
    }

    fn enqueue(&self, data: &[u8], priority: bool) {
        if self.shared.push(data, priority) {
            // Wake the poll so the loop re-arms writable interest.
            self.mux.wake();
        }
    }

    /// Close the socket voluntarily. Idempotent. Queued bytes are
    /// discarded and the loop unregisters the socket on its next
    /// iteration; the failure callback is NOT invoked.
    pub fn close(&self) {
        if self.shared.mark_closed() {
            self.mux.lock_pending_close().push(self.id);
            self.mux.wake();
        }
    }

    /// Schedule `callback` to fire once, no earlier than `delay` from now,
    /// on the loop thread. A zero delay fires on the next loop iteration,
    /// never inline. The timer is scoped to this socket: it is cancelled
    /// if the socket fails, is closed, or the listener shuts down.
    pub fn oneshot<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut timers = self.mux.lock_timers();
        // Checked under the timer lock: a concurrent failure either set
        // the flag already or will cancel this entry right after.
        if self.shared.is_closed() {
            return;
        }
        timers.schedule(self.id, Instant::now() + delay, Box::new(callback));
        drop(timers);
        self.mux.wake();
    }

    /// Cancel every pending timer scheduled through this socket.
    pub fn noshot(&self) {
        self.mux.lock_timers().cancel_all(self.id);
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle").field("id", &self.id).finish()
    }
}
