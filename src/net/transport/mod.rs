//! Transport abstraction module
//!
//! The session never touches sockets. It drives a [`Transport`] that owns
//! every socket, steps it from `poll`, and reacts to the events it reports.
//! Two backends ship with the crate:
//! - [`SocketTransport`]: real UDP/TCP/WebSocket sockets on a private
//!   single-threaded tokio runtime
//! - [`MemoryTransport`]: an in-process loopback hub, fully deterministic

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::error::TransportError;
use crate::net::address::Protocol;

pub mod memory;
pub mod socket;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use socket::SocketTransport;

/// Handle of a listener or connection owned by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something that happened on the backend since the last step
#[derive(Debug)]
pub enum TransportEvent {
    /// A listener accepted a new peer. Reading has already started.
    Accepted {
        listener: ConnectionId,
        conn: ConnectionId,
        peer: SocketAddr,
    },
    /// An outbound stream connection finished connecting
    Connected {
        conn: ConnectionId,
        result: Result<(), TransportError>,
    },
    /// Bytes arrived on a connection
    Received { conn: ConnectionId, data: Bytes },
    /// A connection or listener went away. Never reported after `close`.
    Closed { conn: ConnectionId },
}

/// Non-blocking I/O backend driven by a session
pub trait Transport {
    /// Run the backend once, waiting at most `timeout` for the first event
    fn step(&mut self, timeout: Duration) -> Vec<TransportEvent>;

    /// Start an outbound connection to `target`, which is `host:port`
    /// followed by the request path for WebSocket.
    ///
    /// Stream protocols report completion with [`TransportEvent::Connected`];
    /// UDP is usable immediately and reports nothing.
    fn connect(&mut self, protocol: Protocol, target: &str) -> Result<ConnectionId, TransportError>;

    /// Bind a local address and start accepting peers
    fn bind(&mut self, protocol: Protocol, authority: &str) -> Result<ConnectionId, TransportError>;

    /// Queue bytes on a connection
    fn write(&mut self, conn: ConnectionId, data: Bytes) -> Result<(), TransportError>;

    /// Flush pending writes, then close. Reported with `Closed`.
    fn shutdown(&mut self, conn: ConnectionId) -> Result<(), TransportError>;

    /// Close immediately without reporting anything. The socket may be
    /// released on the next `step`.
    fn close(&mut self, conn: ConnectionId);

    fn peer_addr(&self, conn: ConnectionId) -> Option<SocketAddr>;

    fn local_addr(&self, conn: ConnectionId) -> Option<SocketAddr>;

    /// Drop every listener and connection, releasing their sockets before
    /// returning
    fn reset(&mut self);
}

/// Split a connect target into its authority and request path
pub(crate) fn split_target(target: &str) -> (&str, &str) {
    match target.find('/') {
        Some(index) => target.split_at(index),
        None => (target, "/"),
    }
}
