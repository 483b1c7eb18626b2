//! # Server Core
//!
//! Owns the listening sockets, drives the codec per connection/datagram,
//! resolves agents, and publishes protocol events on the bus.
//!
//! ## Scheduling model
//!
//! Task-per-connection for the stream transport: each accepted connection
//! runs its own read loop and is the sole owner of that connection's
//! framing state. The datagram transport is a single reactor task on the
//! shared socket; each datagram is one complete frame. Both ingestion
//! paths feed the same event-publish pipeline.
//!
//! Read-loop shutdown ordering is load-bearing: the loop releases its read
//! half and resolves the done channel *before* publishing its failure, so
//! a connection-error handler can call `Agent::close` (which waits on that
//! channel) without deadlocking.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::registry::AgentRegistry;
use crate::agent::{Agent, ConnKey, DatagramConn, TransportKind};
use crate::config::ServerConfig;
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::bus::Bus;
use crate::protocol::event::{Event, EventContext, EventData, EventType};
use crate::protocol::message::{parse_auth_request, WolInfo};

pub(crate) struct ServerState {
    config: ServerConfig,
    registry: Arc<AgentRegistry>,
    bus: Arc<Bus>,
}

/// Cheap handle onto a running server: diagnostics and collaborator
/// bus registration.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    /// The event bus; external collaborators (e.g. the WOL-trigger
    /// subsystem) register their handlers here before `run` is awaited.
    pub fn bus(&self) -> &Bus {
        &self.state.bus
    }

    /// Diagnostic registry table: identity, peer address, transport kind.
    pub fn dump_agent_table(&self) -> Result<String> {
        self.state.registry.dump()
    }

    pub fn agent_count(&self) -> Result<usize> {
        self.state.registry.len()
    }

    /// Read-only view for the WOL-trigger collaborator: the descriptor
    /// list carried by the agent currently holding `id`.
    pub fn wol_infos(&self, id: &Uuid) -> Result<Option<Vec<WolInfo>>> {
        Ok(self
            .state
            .registry
            .find_by_identity(id)?
            .map(|agent| agent.wol_infos()))
    }
}

/// The session server: one stream listener, one datagram socket, one
/// registry, one bus.
pub struct Server {
    state: Arc<ServerState>,
    listener: TcpListener,
    socket: Arc<UdpSocket>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
}

impl Server {
    /// Bind both transports and wire the core handlers.
    pub async fn bind(config: ServerConfig) -> Result<Server> {
        config.validate_strict()?;

        let listener = TcpListener::bind(config.tcp_addr.as_str()).await?;
        let socket = Arc::new(UdpSocket::bind(config.udp_addr.as_str()).await?);
        let tcp_addr = listener.local_addr()?;
        let udp_addr = socket.local_addr()?;

        let registry = Arc::new(AgentRegistry::new());
        let bus = Arc::new(Bus::new());
        handlers::register_handlers(&bus, &registry);

        info!(tcp = %tcp_addr, udp = %udp_addr, "listening");

        Ok(Server {
            state: Arc::new(ServerState {
                config,
                registry,
                bus,
            }),
            listener,
            socket,
            tcp_addr,
            udp_addr,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: self.state.clone(),
        }
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Serve until a shutdown signal arrives, then stop accepting, tear
    /// down every tracked connection, and wait for all loops to finish.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let state = self.state;
        let cancel = CancellationToken::new();

        let udp_task = tokio::spawn(run_datagram_loop(
            self.socket.clone(),
            state.clone(),
            cancel.child_token(),
        ));
        let sweeper_task = tokio::spawn(run_idle_sweeper(state.clone(), cancel.child_token()));

        let mut conn_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, draining connections");
                    break;
                }

                // Reap finished read loops so the set does not grow with
                // every closed connection.
                Some(_) = conn_tasks.join_next(), if !conn_tasks.is_empty() => {}

                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            spawn_stream_conn(&mut conn_tasks, stream, peer, state.clone());
                        }
                        Err(e) => {
                            error!(error = %e, "error accepting connection");
                        }
                    }
                }
            }
        }

        cancel.cancel();

        match state.registry.drain() {
            Ok(agents) => {
                for agent in agents {
                    agent.close().await;
                }
            }
            Err(e) => error!(error = %e, "failed to drain registry"),
        }

        while conn_tasks.join_next().await.is_some() {}
        let _ = udp_task.await;
        let _ = sweeper_task.await;

        info!("server stopped");
        Ok(())
    }
}

/// Create the anonymous stream agent, track it, and start its read loop.
fn spawn_stream_conn(
    tasks: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
) {
    let (read_half, write_half) = stream.into_split();
    let cancel = CancellationToken::new();
    let (done_tx, done_rx) = oneshot::channel();
    let agent = Arc::new(Agent::stream(peer, write_half, cancel.clone(), done_rx));

    if let Err(e) = state.registry.insert(agent.clone()) {
        error!(peer = %peer, error = %e, "failed to track connection");
        return;
    }

    info!(peer = %peer, "connection accepted");
    tasks.spawn(run_stream_loop(agent, read_half, cancel, done_tx, state));
}

/// Per-connection read loop: reassemble frames, route them, and funnel the
/// terminal failure into connection-error handling.
async fn run_stream_loop(
    agent: Arc<Agent>,
    read_half: OwnedReadHalf,
    cancel: CancellationToken,
    done_tx: oneshot::Sender<()>,
    state: Arc<ServerState>,
) {
    let idle = state.config.idle_timeout();
    let codec = PacketCodec::with_limit(state.config.max_payload_size);
    let mut framed = FramedRead::new(read_half, codec);

    debug!(peer = %agent.peer(), "read loop start");

    let (event_type, failure) = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                break (EventType::ConnectionReadError, ProtocolError::ConnectionClosed);
            }
            next = timeout(idle, framed.next()) => next,
        };

        let frame = match next {
            // Idle deadline: twice the heartbeat interval without a frame.
            Err(_) => break (EventType::ConnectionReadError, ProtocolError::ConnectionTimeout),
            Ok(None) => break (EventType::ConnectionReadError, ProtocolError::ConnectionClosed),
            Ok(Some(Err(e @ ProtocolError::Io(_)))) => {
                break (EventType::ConnectionReadError, e)
            }
            Ok(Some(Err(e))) => break (EventType::ConnectionUnmarshalError, e),
            Ok(Some(Ok(frame))) => frame,
        };

        if let Err(e) = agent.on_packet(&state.bus, frame).await {
            break (EventType::ConnectionUnmarshalError, e);
        }
    };

    // Ordering matters: release the read half and resolve the done channel
    // before publishing, so the error handler's close() cannot deadlock.
    drop(framed);
    let _ = done_tx.send(());

    agent.report_conn_error(&state.bus, event_type, failure).await;
    debug!(peer = %agent.peer(), "read loop end");
}

/// Reactor for the datagram transport: one frame per datagram, shared
/// socket, agents resolved by peer address.
async fn run_datagram_loop(
    socket: Arc<UdpSocket>,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];
    debug!("datagram loop start");

    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    error!(error = %e, "datagram receive error");
                    continue;
                }
            },
        };

        let packet = match Packet::from_datagram_bounded(&buf[..len], state.config.max_payload_size)
        {
            Ok(packet) => packet,
            Err(e) => {
                warn!(peer = %peer, error = %e, "malformed datagram dropped");
                continue;
            }
        };

        let key = ConnKey::new(TransportKind::Datagram, peer);
        let known = match state.registry.find_by_key(&key) {
            Ok(known) => known,
            Err(e) => {
                error!(error = %e, "registry lookup failed");
                continue;
            }
        };

        match known {
            Some(agent) => {
                if let Err(e) = agent.on_packet(&state.bus, packet).await {
                    agent
                        .report_conn_error(&state.bus, EventType::ConnectionUnmarshalError, e)
                        .await;
                }
            }
            None => handle_anonymous_datagram(&socket, &state, peer, packet).await,
        }
    }

    debug!("datagram loop end");
}

/// Frames from an unknown datagram peer may only register or authenticate.
async fn handle_anonymous_datagram(
    socket: &Arc<UdpSocket>,
    state: &Arc<ServerState>,
    peer: SocketAddr,
    packet: Packet,
) {
    let conn = DatagramConn {
        socket: socket.clone(),
        peer,
    };

    match EventType::from_wire(packet.packet_type) {
        Some(EventType::AgentRegister) => {
            state
                .bus
                .publish(Event::new(
                    EventType::AgentRegister,
                    EventContext::Conn(conn),
                    EventData::None,
                ))
                .await;
        }
        Some(EventType::AgentAuthRequest) => match parse_auth_request(&packet.payload) {
            Ok((id, wol_infos)) => {
                state
                    .bus
                    .publish(Event::new(
                        EventType::AgentAuthRequest,
                        EventContext::Conn(conn),
                        EventData::Auth { id, wol_infos },
                    ))
                    .await;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "rejected datagram auth");
                if let Err(e) = conn.respond_err(&e.to_string()).await {
                    debug!(peer = %peer, error = %e, "error response not delivered");
                }
            }
        },
        _ => {
            let rejection = ProtocolError::NotAuthenticated(packet.packet_type);
            warn!(peer = %peer, packet_type = packet.packet_type, "datagram from unknown peer");
            if let Err(e) = conn.respond_err(&rejection.to_string()).await {
                debug!(peer = %peer, error = %e, "error response not delivered");
            }
        }
    }
}

/// Datagram agents have no per-connection read to time out, so a periodic
/// sweep applies the same idle deadline and funnels expiries into the
/// connection-error path. Stream agents time out in their own read loops.
async fn run_idle_sweeper(state: Arc<ServerState>, cancel: CancellationToken) {
    let period = state.config.heartbeat_interval;
    let deadline = state.config.idle_timeout().as_secs().max(1) as i64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        let agents = match state.registry.snapshot() {
            Ok(agents) => agents,
            Err(e) => {
                error!(error = %e, "registry snapshot failed");
                continue;
            }
        };

        let now = crate::agent::epoch_seconds();
        for agent in agents {
            if agent.kind() == TransportKind::Datagram
                && !agent.is_exit_signaled()
                && now - agent.last_active() > deadline
            {
                debug!(peer = %agent.peer(), "idle deadline expired");
                agent
                    .report_conn_error(
                        &state.bus,
                        EventType::ConnectionReadError,
                        ProtocolError::ConnectionTimeout,
                    )
                    .await;
            }
        }
    }
}
