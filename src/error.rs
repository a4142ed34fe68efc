//! Error handling module
//!
//! Defines the error types for pollnet sessions. Every layer has its own enum;
//! [`PollnetError`] wraps them for the public API.

use std::io;

use thiserror::Error;

/// Main error type for pollnet
#[derive(Error, Debug)]
pub enum PollnetError {
    /// Address parsing errors
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Framing errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Backend errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Address specification errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,

    #[error("No protocol enabled")]
    NoProtocol,

    #[error("Protocol {0} is not enabled")]
    ProtocolNotAllowed(&'static str),

    #[error("WebSocket cannot be combined with other protocols without a scheme")]
    AmbiguousProtocol,

    #[error("Missing host in: {0}")]
    MissingHost(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Port 0 is not a connectable port")]
    ZeroPort,
}

/// Frame encoding and extraction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty payload")]
    EmptyPayload,

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid frame length header: {0}")]
    InvalidLength(u32),

    #[error("Text payload contains a NUL byte")]
    EmbeddedTerminator,

    #[error("JSON error: {0}")]
    Json(String),
}

/// Backend errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unknown connection: {0}")]
    UnknownConnection(u64),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Address in use: {0}")]
    AddressInUse(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session already open")]
    AlreadyOpen,
}

/// Result type alias for pollnet operations
pub type Result<T> = std::result::Result<T, PollnetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::ConnectionClosed;
        assert_eq!(err.to_string(), "Connection closed");

        let err = CodecError::FrameTooLarge {
            size: 600_000,
            max: 524_288,
        };
        assert_eq!(
            err.to_string(),
            "Frame too large: 600000 bytes (max: 524288)"
        );

        let err = AddressError::ProtocolNotAllowed("ws");
        assert_eq!(err.to_string(), "Protocol ws is not enabled");
    }

    #[test]
    fn test_error_wrapping() {
        let err: PollnetError = AddressError::Empty.into();
        assert!(matches!(err, PollnetError::Address(AddressError::Empty)));
        assert_eq!(err.to_string(), "Address error: Empty address");

        let err: PollnetError = SessionError::AlreadyOpen.into();
        assert_eq!(err.to_string(), "Session error: Session already open");

        let err = PollnetError::Config("Max poll iterations must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Max poll iterations must be at least 1"
        );
    }
}
