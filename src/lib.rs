//! Pollnet Session Library
//!
//! A poll-driven, callback-based networking session over UDP, TCP and
//! WebSocket. The host opens a session on an address string, ticks it with
//! `poll`, and receives complete frames through callbacks that fire
//! synchronously from inside the tick.
//!
//! ## Modules
//!
//! - `config` - Session defaults from file and environment
//! - `error` - Error types and result definitions
//! - `net` - Addressing, framing, transports and the session itself

pub mod config;
pub mod error;
pub mod net;

// Re-export commonly used types
pub use config::SessionConfig;
pub use error::{PollnetError, Result};
pub use net::{DataType, Frame, Protocol, Protocols, Role, Session, SessionState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
