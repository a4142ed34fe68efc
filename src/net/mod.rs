//! Networking module
//!
//! Everything a session needs to talk to peers:
//! - Address parsing and protocol selection
//! - Receive buffers and frame codecs
//! - Pluggable transports (sockets, in-memory)
//! - The session state machine and its callbacks

pub mod address;
pub mod buffer;
pub mod callbacks;
pub mod codec;
pub mod interfaces;
pub mod session;
pub mod transport;

pub use address::{AddressSpec, Protocol, Protocols, Role};
pub use codec::{DataType, Frame};
pub use session::{Session, SessionState};
pub use transport::{ConnectionId, Transport, TransportEvent};
