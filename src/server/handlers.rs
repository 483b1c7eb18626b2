//! Business-rule handlers registered on the event bus.
//!
//! Handlers run inline on the publishing task and must stay short. They
//! report outcomes through their own side effects: sending a response
//! frame, mutating the registry, closing a connection.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::registry::AgentRegistry;
use crate::agent::Agent;
use crate::error::constants::ERR_CONNECTION_CLOSED;
use crate::protocol::bus::Bus;
use crate::protocol::event::{Event, EventContext, EventData, EventType};
use crate::protocol::message::RegisterResponse;

/// Wire the core handlers onto the bus. External collaborators (the
/// WOL-trigger subsystem, diagnostics) register their own afterwards.
pub(crate) fn register_handlers(bus: &Bus, registry: &Arc<AgentRegistry>) {
    bus.register(EventType::AgentRegister, handle_register);

    {
        let registry = registry.clone();
        bus.register(EventType::AgentAuthRequest, move |event| {
            handle_auth(registry.clone(), event)
        });
    }

    bus.register(EventType::Heartbeat, handle_heartbeat);
    bus.register(EventType::WolStatusChanged, handle_wol_status);

    for event_type in [
        EventType::ConnectionReadError,
        EventType::ConnectionUnmarshalError,
    ] {
        let registry = registry.clone();
        bus.register(event_type, move |event| {
            handle_conn_error(registry.clone(), event)
        });
    }
}

/// Issue a fresh identity. Purely advisory and stateless: nothing is bound
/// until the caller authenticates with it.
async fn handle_register(event: Event) {
    let id = Uuid::new_v4();
    info!(id = %id, peer = %event.context.peer(), "identity issued");

    let response = RegisterResponse { id: id.to_string() };
    if let Err(e) = event.context.respond_ok(&response).await {
        warn!(peer = %event.context.peer(), error = %e, "failed to send register response");
    }
}

async fn handle_auth(registry: Arc<AgentRegistry>, event: Event) {
    let EventData::Auth { id, wol_infos } = event.data.clone() else {
        error!(peer = %event.context.peer(), "auth event without auth payload");
        return;
    };

    let agent = match &event.context {
        EventContext::Agent(agent) => {
            // Re-authentication is only the same identity refreshing itself;
            // a different identity on a live session is rejected, but the
            // connection stays usable.
            if let Some(current) = agent.identity() {
                if current == id {
                    agent.authenticate(id, wol_infos);
                    debug!(id = %id, peer = %agent.peer(), "re-authenticated");
                    send_ok_empty(agent).await;
                } else {
                    warn!(id = %id, current = %current, peer = %agent.peer(),
                        "auth with foreign identity on authenticated session");
                    if let Err(e) = agent
                        .respond_err(&format!("already authenticated as {current}"))
                        .await
                    {
                        debug!(peer = %agent.peer(), error = %e, "error response not delivered");
                    }
                }
                return;
            }
            agent.clone()
        }
        // First frames from an unknown datagram peer carry no agent; one is
        // created at authentication time.
        EventContext::Conn(conn) => {
            let agent = Arc::new(Agent::datagram(conn.peer, conn.socket.clone()));
            if let Err(e) = registry.insert(agent.clone()) {
                error!(peer = %conn.peer, error = %e, "failed to track datagram agent");
                return;
            }
            agent
        }
    };

    agent.authenticate(id, wol_infos);

    // Newest authentication for an identity always wins; the previous
    // holder is told why, closed, and evicted.
    match registry.bind_identity(id, agent.key()) {
        Ok(Some(old)) => {
            let msg = format!("new {} replace Old {}", agent.peer(), old.peer());
            warn!(id = %id, old_peer = %old.peer(), new_peer = %agent.peer(), "identity takeover");
            if let Err(e) = old.respond_err(&msg).await {
                debug!(peer = %old.peer(), error = %e, "takeover notice not delivered");
            }
            old.close().await;
        }
        Ok(None) => {}
        Err(e) => {
            error!(id = %id, error = %e, "failed to bind identity");
            return;
        }
    }

    info!(id = %id, peer = %agent.peer(), kind = %agent.kind(), "agent authenticated");
    send_ok_empty(&agent).await;
}

async fn handle_heartbeat(event: Event) {
    let Some(agent) = event.context.agent() else {
        error!(peer = %event.context.peer(), "heartbeat event without agent context");
        return;
    };

    agent.refresh();
    debug!(peer = %agent.peer(), "heartbeat");
    send_ok_empty(agent).await;
}

/// The core only acknowledges and refreshes; the WOL-trigger collaborator
/// subscribes to the same event type for the actual status handling.
async fn handle_wol_status(event: Event) {
    let Some(agent) = event.context.agent() else {
        error!(peer = %event.context.peer(), "wol status event without agent context");
        return;
    };

    agent.refresh();
    if let EventData::Status(status) = &event.data {
        info!(peer = %agent.peer(), status = %status, "wol node status changed");
    }
    send_ok_empty(agent).await;
}

/// Uniform teardown for read failures, decode failures, and idle timeouts.
/// Removing the registry entry is the claim that authorizes the close; a
/// miss means another context already owns this teardown.
async fn handle_conn_error(registry: Arc<AgentRegistry>, event: Event) {
    let Some(agent) = event.context.agent() else {
        error!(peer = %event.context.peer(), "connection error without agent context");
        return;
    };

    let msg = match &event.data {
        EventData::Error(msg) => msg.clone(),
        _ => ERR_CONNECTION_CLOSED.to_string(),
    };

    let claimed = match registry.remove_by_key(agent.key()) {
        Ok(claimed) => claimed,
        Err(e) => {
            error!(peer = %agent.peer(), error = %e, "failed to evict agent");
            return;
        }
    };
    let Some(agent) = claimed else {
        debug!(peer = %agent.peer(), "teardown already in progress");
        return;
    };

    // Best effort: the transport is often already unusable.
    if let Err(e) = agent.respond_err(&msg).await {
        debug!(peer = %agent.peer(), error = %e, "error response not delivered");
    }
    agent.close().await;

    match agent.identity() {
        Some(id) => info!(id = %id, peer = %agent.peer(), error = %msg, "agent evicted"),
        None => info!(peer = %agent.peer(), error = %msg, "anonymous connection dropped"),
    }
}

async fn send_ok_empty(agent: &Arc<Agent>) {
    if let Err(e) = agent.respond_ok_empty().await {
        warn!(peer = %agent.peer(), error = %e, "failed to send ok response");
    }
}
