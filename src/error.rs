//! # Error Types
//!
//! Error handling for the agent session protocol.
//!
//! This module defines all error variants that can occur while framing,
//! parsing, and dispatching agent traffic, from low-level I/O errors to
//! protocol violations.
//!
//! ## Error Categories
//! - **I/O Errors**: Socket read/write failures
//! - **Framing Errors**: Malformed headers, oversized or truncated frames
//! - **Protocol Errors**: Bad payloads, invalid identities, state violations
//! - **Lifecycle Errors**: Closed connections, idle timeouts
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Lock-poisoning errors
    pub const ERR_BUS_LOCK: &str = "Failed to acquire lock on event bus";
    pub const ERR_REGISTRY_LOCK: &str = "Failed to acquire lock on agent registry";

    /// Framing errors
    pub const ERR_INVALID_HEADER: &str = "Invalid frame header";
    pub const ERR_OVERSIZED_PACKET: &str = "Packet exceeds maximum payload size";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECTION_TIMEOUT: &str = "Connection timed out (no activity)";

    /// Lifecycle invariants
    pub const ERR_DUPLICATE_CLOSE: &str = "duplicate close on agent";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Payload length mismatch: declared {declared} bytes, got {actual}")]
    PayloadLengthMismatch { declared: usize, actual: usize },

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Unknown packet type: {0}")]
    UnknownPacket(u32),

    #[error("Packet type {0} is not accepted from clients")]
    UnexpectedPacket(u32),

    #[error("Invalid agent identity: {0}")]
    InvalidIdentity(String),

    #[error("Packet type {0} requires an authenticated agent")]
    NotAuthenticated(u32),

    #[error("Packet type {0} is only accepted before authentication")]
    AnonymousOnly(u32),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
