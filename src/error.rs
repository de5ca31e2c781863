//! # Error Types
//!
//! Comprehensive error handling for the protocol core.
//!
//! This module defines all error variants that can occur during protocol operations,
//! from low-level I/O errors to schema, codec, handshake and queueing failures.
//!
//! ## Error Categories
//! - **Start-up Errors**: schema documents that cannot be merged, bad configuration
//! - **Per-message Errors**: unknown type ids and malformed arguments, recovered by the
//!   reader with an "invalid message" notice up to a configured limit
//! - **Handshake Errors**: any key-exchange failure, always fatal to the connection
//! - **Programming Errors**: incomplete messages, sending after shutdown, disabled handlers
//! - **Transport Errors**: I/O, framing and TLS failures
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use peerwire::error::{ProtocolError, Result};
//! use peerwire::protocol::registry::TypeRegistry;
//! use tracing::{error, info};
//!
//! fn load(source: &str) -> Result<TypeRegistry> {
//!     let mut registry = TypeRegistry::new();
//!     registry.register(source)?;
//!     Ok(registry)
//! }
//!
//! match load(r#"{"messages":[{"id":1,"name":"Echo","arguments":[]}]}"#) {
//!     Ok(registry) => info!(types = registry.len(), "Schema loaded"),
//!     Err(ProtocolError::SchemaError(reason)) => error!(%reason, "Bad schema"),
//!     Err(e) => error!(error = %e, "Unexpected failure"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Dispatcher registration
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";

    /// Randomness
    pub const ERR_RNG_FAILED: &str = "Operating system random source failed";

    /// Handshake-specific errors
    pub const ERR_BAD_PUBLIC_KEY: &str = "Peer public key must be 32 bytes";
    pub const ERR_NON_CONTRIBUTORY: &str = "Peer public key produced a non-contributory secret";
    pub const ERR_DUPLICATE_PUBLIC_KEY: &str = "Peer public key received twice";
    pub const ERR_UNEXPECTED_SESSION_KEY: &str = "Session key received in wrong role or state";
    pub const ERR_SEALED_KEY_TOO_SHORT: &str = "Sealed session key is truncated";
    pub const ERR_SESSION_KEY_LENGTH: &str = "Session key must be 32 bytes";
    pub const ERR_OPEN_FAILED: &str = "Failed to open sealed session key";
    pub const ERR_SEAL_FAILED: &str = "Failed to seal session key";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Unknown message type id: {0}")]
    UnknownType(i16),

    #[error("Unknown message name: {0}")]
    UnknownMessage(String),

    #[error("Malformed argument: {0}")]
    MalformedArgument(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Message {message} is missing arguments: {}", missing.join(", "))]
    IncompleteMessage {
        message: String,
        missing: Vec<String>,
    },

    #[error("Outbound queue is closed")]
    QueueClosed,

    #[error("No session key installed")]
    NoSessionKey,

    #[error("Handler for {0} is disabled")]
    DisabledMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),

    #[error("TLS error: {0}")]
    TlsError(String),
}

impl ProtocolError {
    /// Whether the reader may recover from this error by notifying the peer
    /// and moving on to the next frame.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownType(_)
                | ProtocolError::MalformedArgument(_)
                | ProtocolError::NoSessionKey
                | ProtocolError::DecryptionFailure
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_message_lists_missing_arguments() {
        let err = ProtocolError::IncompleteMessage {
            message: "Login".into(),
            missing: vec!["user".into(), "password".into()],
        };
        assert_eq!(
            err.to_string(),
            "Message Login is missing arguments: user, password"
        );
    }

    #[test]
    fn decode_errors_are_recoverable() {
        assert!(ProtocolError::UnknownType(7).is_decode_error());
        assert!(ProtocolError::MalformedArgument("x".into()).is_decode_error());
        assert!(!ProtocolError::HandshakeError("x".into()).is_decode_error());
        assert!(!ProtocolError::QueueClosed.is_decode_error());
    }
}
