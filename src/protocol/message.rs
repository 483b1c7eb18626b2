//! JSON request and response payloads.
//!
//! Field names are part of the wire contract; clients send them verbatim.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// One named remote-wake target carried by an agent. Stored by the core,
/// acted upon only by the WOL-trigger collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WolInfo {
    pub name: String,
    pub mac_addr: String,
    pub port: u16,
    pub broadcast_addr: String,
    pub ip: String,
}

/// Client authentication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Asserted stable identity; must be a UUID string
    pub id: String,
    /// Descriptor list, replaced wholesale at every authentication
    #[serde(default)]
    pub wol_infos: Vec<WolInfo>,
}

/// Payload of the OK response to a register request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: String,
}

/// Parse and identity-validate an authentication request payload.
pub fn parse_auth_request(payload: &[u8]) -> Result<(Uuid, Vec<WolInfo>)> {
    let req: AuthRequest = serde_json::from_slice(payload)?;
    let id = Uuid::parse_str(&req.id)
        .map_err(|e| ProtocolError::InvalidIdentity(format!("{}: {e}", req.id)))?;
    Ok((id, req.wol_infos))
}
