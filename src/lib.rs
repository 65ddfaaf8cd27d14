//! sockmux - readiness-based socket multiplexer for client transports.
//!
//! This crate manages a set of non-blocking sockets on a single thread:
//! it dispatches read readiness to per-socket handlers, buffers outbound
//! bytes until the OS reports the socket writable, and runs oneshot
//! timers scoped to each socket's lifetime. It is the transport layer of
//! a messaging-protocol client: the protocol above it only sees opaque
//! byte chunks and a failure notification.
//!
//! # Quick Start
//!
//! ```ignore
//! use sockmux::{Listener, SocketHandler};
//! use std::time::Duration;
//!
//! struct Echo;
//!
//! impl SocketHandler for Echo {
//!     fn handle_read(&mut self, data: &[u8]) {
//!         println!("got {} bytes", data.len());
//!     }
//!     fn handle_failure(&mut self) {
//!         println!("connection lost");
//!     }
//! }
//!
//! let mut listener = Listener::new()?;
//! let stream = std::net::TcpStream::connect("127.0.0.1:5672")?;
//! let handle = listener.register(stream, Box::new(Echo))?;
//!
//! handle.send(b"hello");
//! handle.oneshot(Duration::from_secs(30), move || {
//!     // e.g. schedule a protocol-level keepalive
//! });
//!
//! loop {
//!     listener.wait(Some(Duration::from_millis(100)))?;
//! }
//! ```
//!
//! # Design
//!
//! - **Demand-driven interest**: a socket is registered for writable
//!   readiness only while it has queued bytes. Every `send` re-arms the
//!   interest; a full drain drops it. Idle sockets never busy-loop on
//!   "still writable" reports.
//! - **Contained failures**: an OS error, hangup, or EOF is terminal for
//!   that socket only — it is unregistered, its timers are cancelled, and
//!   its failure handler fires exactly once. Other sockets in the same
//!   readiness batch are unaffected, as are sockets whose handlers panic.
//! - **External drive**: [`Listener::wait`] runs exactly one loop
//!   iteration; the embedding application owns the loop and its cadence.
//!
//! # Threading
//!
//! All I/O and all callbacks happen on the thread calling `wait`.
//! [`SocketHandle`] operations (`send`, `close`, `oneshot`, `noshot`) are
//! safe from any thread and wake a blocked `wait` when they need the loop
//! to act.

mod builder;
mod error;
mod handle;
mod handler;
mod listener;
mod mux;
mod socket;
mod timer;
mod types;

pub use builder::ListenerBuilder;
pub use error::{Error, Result};
pub use handle::SocketHandle;
pub use handler::SocketHandler;
pub use listener::Listener;
pub use types::SocketId;
