//! # Protocol Layer
//!
//! Event model, wire messages, and the in-process event bus that decouples
//! frame parsing from the business-rule handlers.
//!
//! ## Components
//! - **EventType / Event**: the closed, numerically-namespaced event
//!   enumeration and the ephemeral occurrences published on the bus
//! - **Bus**: synchronous, ordering-preserving publish/subscribe
//! - **Messages**: JSON request/response payloads

pub mod bus;
pub mod event;
pub mod message;
