//! Per-socket event handler trait.

/// Callbacks invoked by the event loop for one registered socket.
///
/// Implementations run on the loop thread, inside
/// [`Listener::wait`](crate::Listener::wait). A panic in a callback is
/// caught at the dispatch boundary and logged; it never aborts the loop
/// iteration or affects other sockets in the same batch.
pub trait SocketHandler: Send {
    /// Bytes arrived on the socket.
    ///
    /// Called once per contiguous chunk read from the OS, in arrival
    /// order. Never called with an empty slice: a zero-length read is a
    /// peer hangup and is reported through [`handle_failure`]
    /// instead.
    ///
    /// [`handle_failure`]: SocketHandler::handle_failure
    fn handle_read(&mut self, data: &[u8]);

    /// The socket is no longer usable.
    ///
    /// Invoked at most once over the socket's lifetime: on an OS error or
    /// hangup, on EOF, or for every live socket during
    /// [`shutdown`](crate::Listener::shutdown). After this call no further
    /// callbacks fire for the socket and any of its pending timers are
    /// cancelled. A voluntary [`close`](crate::SocketHandle::close) does
    /// not trigger it.
    fn handle_failure(&mut self);
}
