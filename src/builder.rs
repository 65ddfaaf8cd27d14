//! Listener builder with fluent API.

use crate::error::Result;
use crate::listener::Listener;
use crate::mux::Multiplexer;

/// Builder for creating a [`Listener`] with custom configuration.
///
/// # Example
///
/// ```ignore
/// use sockmux::Listener;
///
/// let listener = Listener::builder()
///     .event_capacity(256)
///     .read_buffer_size(32 * 1024)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct ListenerBuilder {
    event_capacity: usize,
    read_buffer_size: usize,
    max_sockets: usize,
}

impl Default for ListenerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            event_capacity: 1024,        // readiness events per poll
            read_buffer_size: 16 * 1024, // one OS read per chunk
            max_sockets: 4096,
        }
    }

    /// Set the capacity of the readiness event buffer.
    ///
    /// Default: 1024
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the size of the buffer each OS read goes through. Bounds the
    /// chunk size delivered to `handle_read`.
    ///
    /// Default: 16KB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the maximum number of concurrently registered sockets.
    ///
    /// Default: 4096
    pub fn max_sockets(mut self, max: usize) -> Self {
        self.max_sockets = max;
        self
    }

    /// Build the listener with the configured settings.
    pub fn build(self) -> Result<Listener> {
        let mux = Multiplexer::new(self.event_capacity, self.read_buffer_size, self.max_sockets)?;
        Ok(Listener::from_mux(mux))
    }
}
