//! # Core Protocol Components
//!
//! Low-level frame handling for the agent session protocol.
//!
//! ## Components
//! - **Packet**: one `(type, payload)` frame of the wire format
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Type(4, LE)] [Length(4, LE)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Declared payload lengths are validated against a ceiling before any
//!   allocation (default 16 MiB)

pub mod codec;
pub mod packet;
