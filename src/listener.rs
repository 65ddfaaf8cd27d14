//! Public facade over the multiplexer.

use std::net::TcpStream;
use std::time::Duration;

use crate::builder::ListenerBuilder;
use crate::error::Result;
use crate::handle::SocketHandle;
use crate::handler::SocketHandler;
use crate::mux::Multiplexer;

/// An externally driven socket event loop.
///
/// Callers register connected, non-blocking sockets and then drive the
/// loop by calling [`wait`](Listener::wait) repeatedly — typically from a
/// dedicated thread, at whatever cadence suits the embedding application.
/// All handler callbacks run inside `wait` on the driving thread;
/// [`SocketHandle`] operations are safe from any thread.
pub struct Listener {
    mux: Multiplexer,
}

impl Listener {
    /// Create a listener with default settings.
    pub fn new() -> Result<Self> {
        ListenerBuilder::new().build()
    }

    /// Create a builder for custom configuration.
    pub fn builder() -> ListenerBuilder {
        ListenerBuilder::new()
    }

    pub(crate) fn from_mux(mux: Multiplexer) -> Self {
        Self { mux }
    }

    /// Take ownership of a connected stream and watch it for readiness.
    ///
    /// The stream is switched to non-blocking mode and armed for reads;
    /// writable interest is requested only while the returned handle has
    /// queued outbound bytes.
    ///
    /// Fails with [`Error::AlreadyRegistered`] if the stream's file
    /// descriptor is already registered (the original registration is
    /// untouched), and with [`Error::ShutDown`] after
    /// [`shutdown`](Listener::shutdown).
    ///
    /// [`Error::AlreadyRegistered`]: crate::Error::AlreadyRegistered
    /// [`Error::ShutDown`]: crate::Error::ShutDown
    pub fn register(
        &mut self,
        stream: TcpStream,
        handler: Box<dyn SocketHandler>,
    ) -> Result<SocketHandle> {
        self.mux.register(stream, handler)
    }

    /// Drive one loop iteration, blocking for readiness up to `timeout`.
    ///
    /// `None` blocks until an event, a timer deadline, or a cross-thread
    /// wakeup; `Some(Duration::ZERO)` is a non-blocking poll. The timeout
    /// is shortened automatically so pending timers fire promptly.
    /// Returns the number of socket events dispatched.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.mux.wait(timeout)
    }

    /// Tear down every registered socket, invoking each failure handler
    /// (a forced notification so callers can clean up), and cancel all
    /// timers. Terminal: further `register` and `wait` calls are
    /// rejected, while handle operations become no-ops.
    pub fn shutdown(&mut self) {
        self.mux.shutdown();
    }

    /// Number of currently registered sockets.
    pub fn socket_count(&self) -> usize {
        self.mux.socket_count()
    }

    /// Whether [`shutdown`](Listener::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.mux.is_shut_down()
    }
}
