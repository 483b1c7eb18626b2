//! Event enumeration and the event value published on the bus.
//!
//! The numeric values are a stable wire contract shared with agent clients
//! and must be preserved bit-exact:
//!
//! | Range   | Meaning                                          |
//! |---------|--------------------------------------------------|
//! | 100-199 | business outcome (100 = OK, 110 = error)         |
//! | 500-549 | transport-layer error classes                    |
//! | 700-730 | agent protocol operations                        |
//!
//! The 500-range types never appear on the wire; they exist only for bus
//! dispatch inside the server.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::agent::{Agent, DatagramConn};
use crate::protocol::message::WolInfo;

/// Closed enumeration of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventType {
    /// Request handled, optional JSON payload
    ResponseOk = 100,
    /// Request failed, payload is a JSON string with the message
    ResponseError = 110,

    /// Reading from a transport failed (I/O error, idle timeout, peer gone)
    ConnectionReadError = 510,
    /// A frame or payload could not be decoded
    ConnectionUnmarshalError = 512,

    /// Anonymous identity issuance request
    AgentRegister = 700,
    /// Authentication request binding an identity and WOL descriptors
    AgentAuthRequest = 710,
    /// Liveness signal from an authenticated agent
    Heartbeat = 712,
    /// An agent reports a status change of one of its WOL nodes
    WolStatusChanged = 720,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::ResponseOk,
        EventType::ResponseError,
        EventType::ConnectionReadError,
        EventType::ConnectionUnmarshalError,
        EventType::AgentRegister,
        EventType::AgentAuthRequest,
        EventType::Heartbeat,
        EventType::WolStatusChanged,
    ];

    /// Map a wire packet type to an event type.
    pub fn from_wire(value: u32) -> Option<EventType> {
        match value {
            100 => Some(EventType::ResponseOk),
            110 => Some(EventType::ResponseError),
            510 => Some(EventType::ConnectionReadError),
            512 => Some(EventType::ConnectionUnmarshalError),
            700 => Some(EventType::AgentRegister),
            710 => Some(EventType::AgentAuthRequest),
            712 => Some(EventType::Heartbeat),
            720 => Some(EventType::WolStatusChanged),
            _ => None,
        }
    }

    pub fn wire_value(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            EventType::ResponseOk => "response ok",
            EventType::ResponseError => "response error",
            EventType::ConnectionReadError => "connection read error",
            EventType::ConnectionUnmarshalError => "connection unmarshal error",
            EventType::AgentRegister => "agent register",
            EventType::AgentAuthRequest => "agent auth request",
            EventType::Heartbeat => "heartbeat",
            EventType::WolStatusChanged => "wol node status changed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The emitter of an event: a raw transport endpoint for pre-identity
/// datagram traffic, or the Agent itself once one exists.
#[derive(Clone)]
pub enum EventContext {
    Conn(DatagramConn),
    Agent(Arc<Agent>),
}

impl EventContext {
    pub fn peer(&self) -> std::net::SocketAddr {
        match self {
            EventContext::Conn(conn) => conn.peer,
            EventContext::Agent(agent) => agent.peer(),
        }
    }

    pub fn agent(&self) -> Option<&Arc<Agent>> {
        match self {
            EventContext::Agent(agent) => Some(agent),
            EventContext::Conn(_) => None,
        }
    }

    pub async fn respond_ok<T: serde::Serialize>(&self, data: &T) -> crate::error::Result<()> {
        match self {
            EventContext::Conn(conn) => conn.respond_ok(data).await,
            EventContext::Agent(agent) => agent.respond_ok(data).await,
        }
    }

    pub async fn respond_ok_empty(&self) -> crate::error::Result<()> {
        match self {
            EventContext::Conn(conn) => conn.respond_ok_empty().await,
            EventContext::Agent(agent) => agent.respond_ok_empty().await,
        }
    }

    pub async fn respond_err(&self, msg: &str) -> crate::error::Result<()> {
        match self {
            EventContext::Conn(conn) => conn.respond_err(msg).await,
            EventContext::Agent(agent) => agent.respond_err(msg).await,
        }
    }
}

/// Variant payload carried by an event.
#[derive(Clone, Debug)]
pub enum EventData {
    None,
    /// Parsed, identity-validated authentication request
    Auth {
        id: Uuid,
        wol_infos: Vec<WolInfo>,
    },
    /// Error message for the 500-range event types
    Error(String),
    /// Raw JSON status report from a WOL node
    Status(serde_json::Value),
}

/// One occurrence on the bus. Events are ephemeral: constructed per
/// occurrence, never persisted.
#[derive(Clone)]
pub struct Event {
    pub event_type: EventType,
    pub context: EventContext,
    pub data: EventData,
}

impl Event {
    pub fn new(event_type: EventType, context: EventContext, data: EventData) -> Self {
        Self {
            event_type,
            context,
            data,
        }
    }
}
