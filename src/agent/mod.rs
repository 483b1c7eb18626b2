//! # Agent Entity
//!
//! The server-side representation of one connected remote peer, before or
//! after it holds an identity, plus the registry that tracks all of them.
//!
//! An agent owns its transport handle while connected: the write half of a
//! TCP stream, or the shared UDP socket together with the peer address. The
//! send path is uniform across both; reading differs fundamentally
//! (continuous stream vs. one frame per datagram) and lives with the server
//! ingestion loops.

pub mod registry;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::bus::Bus;
use crate::protocol::event::{Event, EventContext, EventData, EventType};
use crate::protocol::message::{parse_auth_request, WolInfo};

/// Transport capability tag; fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "tcp"),
            TransportKind::Datagram => write!(f, "udp"),
        }
    }
}

/// Registry key for one transport endpoint, e.g. `tcp://10.0.0.7:52114`.
/// The kind prefix keeps stream and datagram peers from colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnKey(String);

impl ConnKey {
    pub fn new(kind: TransportKind, peer: SocketAddr) -> Self {
        Self(format!("{kind}://{peer}"))
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn epoch_seconds() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

/// A raw datagram endpoint, used as event context for pre-identity UDP
/// traffic where no [`Agent`] exists yet.
#[derive(Clone)]
pub struct DatagramConn {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

impl DatagramConn {
    pub async fn respond_ok<T: Serialize>(&self, data: &T) -> Result<()> {
        self.send(ok_frame(data)?).await
    }

    pub async fn respond_ok_empty(&self) -> Result<()> {
        self.send(ok_frame_empty()).await
    }

    pub async fn respond_err(&self, msg: &str) -> Result<()> {
        self.send(err_frame(msg)?).await
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.socket.send_to(&frame, self.peer).await?;
        Ok(())
    }
}

enum TransportLink {
    Stream {
        writer: Mutex<OwnedWriteHalf>,
        cancel: CancellationToken,
        /// Resolved by the read loop just before it exits; `close()` waits
        /// on it so no read can fire on a released handle.
        loop_done: Mutex<Option<oneshot::Receiver<()>>>,
    },
    Datagram {
        socket: Arc<UdpSocket>,
    },
}

/// One connected remote peer.
pub struct Agent {
    key: ConnKey,
    peer: SocketAddr,
    link: TransportLink,
    identity: StdMutex<Option<Uuid>>,
    wol_infos: StdMutex<Vec<WolInfo>>,
    last_active: AtomicI64,
    exit_signaled: AtomicBool,
}

impl Agent {
    /// Agent over a stream transport. `cancel` unblocks the read loop,
    /// `loop_done` resolves once that loop has exited.
    pub fn stream(
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        cancel: CancellationToken,
        loop_done: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            key: ConnKey::new(TransportKind::Stream, peer),
            peer,
            link: TransportLink::Stream {
                writer: Mutex::new(writer),
                cancel,
                loop_done: Mutex::new(Some(loop_done)),
            },
            identity: StdMutex::new(None),
            wol_infos: StdMutex::new(Vec::new()),
            last_active: AtomicI64::new(0),
            exit_signaled: AtomicBool::new(false),
        }
    }

    /// Agent over the shared datagram socket, replying to `peer`.
    pub fn datagram(peer: SocketAddr, socket: Arc<UdpSocket>) -> Self {
        Self {
            key: ConnKey::new(TransportKind::Datagram, peer),
            peer,
            link: TransportLink::Datagram { socket },
            identity: StdMutex::new(None),
            wol_infos: StdMutex::new(Vec::new()),
            last_active: AtomicI64::new(0),
            exit_signaled: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self.link {
            TransportLink::Stream { .. } => TransportKind::Stream,
            TransportLink::Datagram { .. } => TransportKind::Datagram,
        }
    }

    pub fn key(&self) -> &ConnKey {
        &self.key
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn identity(&self) -> Option<Uuid> {
        *self.identity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wol_infos(&self) -> Vec<WolInfo> {
        self.wol_infos
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    pub fn is_exit_signaled(&self) -> bool {
        self.exit_signaled.load(Ordering::SeqCst)
    }

    /// Update the last-activity timestamp to now.
    pub fn refresh(&self) {
        self.last_active.store(epoch_seconds(), Ordering::Relaxed);
    }

    /// Bind an identity and replace the WOL descriptor list wholesale.
    /// Also counts as activity.
    pub fn authenticate(&self, id: Uuid, wol_infos: Vec<WolInfo>) {
        *self.identity.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
        *self.wol_infos.lock().unwrap_or_else(|e| e.into_inner()) = wol_infos;
        self.refresh();
    }

    pub async fn respond_ok<T: Serialize>(&self, data: &T) -> Result<()> {
        self.send(ok_frame(data)?).await
    }

    pub async fn respond_ok_empty(&self) -> Result<()> {
        self.send(ok_frame_empty()).await
    }

    pub async fn respond_err(&self, msg: &str) -> Result<()> {
        debug!(peer = %self.peer, msg, "error response");
        self.send(err_frame(msg)?).await
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        match &self.link {
            TransportLink::Stream { writer, .. } => {
                let mut writer = writer.lock().await;
                writer.write_all(&frame).await?;
            }
            TransportLink::Datagram { socket } => {
                socket.send_to(&frame, self.peer).await?;
            }
        }
        Ok(())
    }

    /// Release the transport. For stream agents this cancels the read loop
    /// and waits until it has observably exited, then shuts the socket down.
    ///
    /// # Panics
    ///
    /// Panics on a second call: a double close is a double release of the
    /// transport, a bug in the caller rather than a runtime condition.
    pub async fn close(&self) {
        if self.exit_signaled.swap(true, Ordering::SeqCst) {
            panic!("{}", constants::ERR_DUPLICATE_CLOSE);
        }

        if let TransportLink::Stream {
            writer,
            cancel,
            loop_done,
        } = &self.link
        {
            cancel.cancel();
            let pending = loop_done.lock().await.take();
            if let Some(done) = pending {
                // A dropped sender also means the loop is gone.
                let _ = done.await;
            }
            let _ = writer.lock().await.shutdown().await;
        }

        info!(peer = %self.peer, kind = %self.kind(), "connection closed");
    }

    /// Funnel a read/decode failure into the bus, unless this agent's own
    /// shutdown induced it.
    pub async fn report_conn_error(
        self: &Arc<Self>,
        bus: &Bus,
        event_type: EventType,
        error: ProtocolError,
    ) {
        if self.is_exit_signaled() {
            debug!(peer = %self.peer, error = %error, "read failure after close, ignored");
            return;
        }

        bus.publish(Event::new(
            event_type,
            EventContext::Agent(self.clone()),
            EventData::Error(error.to_string()),
        ))
        .await;
    }

    /// Route one decoded frame onto the bus, parsing type-specific payloads
    /// first. Errors mean the frame (and connection) cannot be trusted; the
    /// caller funnels them into connection-error handling.
    pub async fn on_packet(self: &Arc<Self>, bus: &Bus, packet: Packet) -> Result<()> {
        let wire_type = packet.packet_type;
        let event_type =
            EventType::from_wire(wire_type).ok_or(ProtocolError::UnknownPacket(wire_type))?;

        let data = match event_type {
            EventType::AgentRegister => {
                if self.identity().is_some() {
                    return Err(ProtocolError::AnonymousOnly(wire_type));
                }
                EventData::None
            }
            EventType::AgentAuthRequest => {
                let (id, wol_infos) = parse_auth_request(&packet.payload)?;
                EventData::Auth { id, wol_infos }
            }
            EventType::Heartbeat => {
                if self.identity().is_none() {
                    return Err(ProtocolError::NotAuthenticated(wire_type));
                }
                EventData::None
            }
            EventType::WolStatusChanged => {
                if self.identity().is_none() {
                    return Err(ProtocolError::NotAuthenticated(wire_type));
                }
                EventData::Status(serde_json::from_slice(&packet.payload)?)
            }
            _ => return Err(ProtocolError::UnexpectedPacket(wire_type)),
        };

        debug!(peer = %self.peer, event_type = %event_type, "packet received");
        bus.publish(Event::new(event_type, EventContext::Agent(self.clone()), data))
            .await;
        Ok(())
    }
}

fn ok_frame_empty() -> Vec<u8> {
    Packet::new(EventType::ResponseOk.wire_value(), Vec::new()).to_bytes()
}

fn ok_frame<T: Serialize>(data: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(data)?;
    Ok(Packet::new(EventType::ResponseOk.wire_value(), payload).to_bytes())
}

fn err_frame(msg: &str) -> Result<Vec<u8>> {
    // The error payload is a JSON string, not an object.
    let payload = serde_json::to_vec(msg)?;
    Ok(Packet::new(EventType::ResponseError.wire_value(), payload).to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HEADER_LEN;

    async fn datagram_agent() -> Arc<Agent> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = socket.local_addr().unwrap();
        Arc::new(Agent::datagram(peer, socket))
    }

    #[tokio::test]
    async fn authenticate_binds_identity_and_descriptors() {
        let agent = datagram_agent().await;
        assert_eq!(agent.identity(), None);
        assert_eq!(agent.last_active(), 0);

        let id = Uuid::new_v4();
        agent.authenticate(
            id,
            vec![WolInfo {
                name: "nas".into(),
                mac_addr: "00:11:22:33:44:55".into(),
                port: 9,
                broadcast_addr: "10.0.0.255".into(),
                ip: "10.0.0.9".into(),
            }],
        );

        assert_eq!(agent.identity(), Some(id));
        assert_eq!(agent.wol_infos().len(), 1);
        assert!(agent.last_active() > 0);
    }

    #[tokio::test]
    #[should_panic(expected = "duplicate close")]
    async fn second_close_panics() {
        let agent = datagram_agent().await;
        agent.close().await;
        agent.close().await;
    }

    #[tokio::test]
    async fn error_frame_payload_is_a_json_string() {
        let frame = err_frame("boom").unwrap();
        let packet = Packet::from_datagram(&frame).unwrap();

        assert_eq!(packet.packet_type, EventType::ResponseError.wire_value());
        let decoded: String = serde_json::from_slice(&packet.payload).unwrap();
        assert_eq!(decoded, "boom");
    }

    #[tokio::test]
    async fn empty_ok_frame_has_no_payload() {
        let frame = ok_frame_empty();
        assert_eq!(frame.len(), HEADER_LEN);

        let packet = Packet::from_datagram(&frame).unwrap();
        assert_eq!(packet.packet_type, EventType::ResponseOk.wire_value());
        assert!(packet.payload.is_empty());
    }

    #[tokio::test]
    async fn unauthenticated_heartbeat_is_a_protocol_error() {
        let agent = datagram_agent().await;
        let bus = Bus::new();

        let result = agent
            .on_packet(&bus, Packet::new(EventType::Heartbeat.wire_value(), Vec::new()))
            .await;
        assert!(matches!(result, Err(ProtocolError::NotAuthenticated(712))));
    }

    #[tokio::test]
    async fn register_after_authentication_is_rejected() {
        let agent = datagram_agent().await;
        agent.authenticate(Uuid::new_v4(), Vec::new());

        let bus = Bus::new();
        let result = agent
            .on_packet(
                &bus,
                Packet::new(EventType::AgentRegister.wire_value(), Vec::new()),
            )
            .await;
        assert!(matches!(result, Err(ProtocolError::AnonymousOnly(700))));
    }

    #[tokio::test]
    async fn unknown_packet_type_is_rejected() {
        let agent = datagram_agent().await;
        let bus = Bus::new();

        let result = agent.on_packet(&bus, Packet::new(999, Vec::new())).await;
        assert!(matches!(result, Err(ProtocolError::UnknownPacket(999))));
    }
}
