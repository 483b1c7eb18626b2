//! # Wakehub
//!
//! Connection management and session protocol core for fleets of remote
//! Wake-on-LAN agents.
//!
//! Agents register, authenticate with a stable UUID identity, and
//! periodically heartbeat over a length-prefixed binary protocol carried on
//! both a stream (TCP) and a datagram (UDP) transport.
//!
//! ## Architecture
//! - [`core`]: wire format and framing codec
//! - [`protocol`]: event model, bus, and JSON messages
//! - [`agent`]: the per-connection entity and the dual-keyed registry
//! - [`server`]: listeners, ingestion loops, and business handlers
//!
//! ## Data Flow
//! ```text
//! raw bytes → codec → (type, payload) frame → agent resolution
//!           → event on the bus → handler → response frame → transport
//! ```
//!
//! The registry enforces at most one live agent per identity: the newest
//! authentication always wins and the previous holder is disconnected.

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod server;

pub use config::ServerConfig;
pub use error::{ProtocolError, Result};
pub use server::{Server, ServerHandle};
