//! Dual-keyed agent store.
//!
//! The primary map owns agents by transport key; the secondary map is a
//! back-reference from identity to transport key, never ownership.
//!
//! Invariants:
//! 1. every secondary entry's target key exists in the primary map
//! 2. at most one primary entry carries a given identity at any time
//! 3. removing a primary entry removes any secondary entry pointing at it
//! 4. removing by identity removes exactly one primary+secondary pair
//!
//! Removal doubles as a teardown claim: whoever gets the `Arc<Agent>` back
//! from a `remove_*` or `bind_identity` displacement owns closing it, so a
//! live agent is only ever closed once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::agent::{Agent, ConnKey};
use crate::error::constants::ERR_REGISTRY_LOCK;
use crate::error::{ProtocolError, Result};

#[derive(Default)]
struct RegistryInner {
    by_key: HashMap<ConnKey, Arc<Agent>>,
    by_identity: HashMap<Uuid, ConnKey>,
}

/// Transport-key → Agent (ownership) plus identity → transport-key
/// (back-reference). Mutated only from bus handlers and ingestion loops,
/// which run on multiple tasks, hence the mutex.
#[derive(Default)]
pub struct AgentRegistry {
    inner: Mutex<RegistryInner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryInner>> {
        self.inner
            .lock()
            .map_err(|_| ProtocolError::Internal(ERR_REGISTRY_LOCK.to_string()))
    }

    /// Track an agent under its transport key.
    pub fn insert(&self, agent: Arc<Agent>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.by_key.insert(agent.key().clone(), agent);
        Ok(())
    }

    pub fn find_by_key(&self, key: &ConnKey) -> Result<Option<Arc<Agent>>> {
        Ok(self.lock()?.by_key.get(key).cloned())
    }

    pub fn find_by_identity(&self, id: &Uuid) -> Result<Option<Arc<Agent>>> {
        let inner = self.lock()?;
        let Some(key) = inner.by_identity.get(id) else {
            return Ok(None);
        };
        Ok(inner.by_key.get(key).cloned())
    }

    /// Point `id` at `key`, atomically evicting whichever primary entry
    /// previously carried that identity. The displaced agent (the takeover
    /// loser) is returned so exactly one caller owns its teardown.
    pub fn bind_identity(&self, id: Uuid, key: &ConnKey) -> Result<Option<Arc<Agent>>> {
        let mut inner = self.lock()?;
        if !inner.by_key.contains_key(key) {
            return Err(ProtocolError::Internal(format!(
                "bind target {key} is not registered"
            )));
        }

        if let Some(old_key) = inner.by_identity.insert(id, key.clone()) {
            if old_key != *key {
                return Ok(inner.by_key.remove(&old_key));
            }
        }
        Ok(None)
    }

    /// Remove the primary entry under `key`, scanning out any identity
    /// back-reference pointing at it.
    pub fn remove_by_key(&self, key: &ConnKey) -> Result<Option<Arc<Agent>>> {
        let mut inner = self.lock()?;
        let agent = inner.by_key.remove(key);
        if agent.is_some() {
            inner.by_identity.retain(|_, k| *k != *key);
        }
        Ok(agent)
    }

    /// Remove the primary+secondary pair for `id`, if any.
    pub fn remove_by_identity(&self, id: &Uuid) -> Result<Option<Arc<Agent>>> {
        let mut inner = self.lock()?;
        let Some(key) = inner.by_identity.remove(id) else {
            return Ok(None);
        };
        Ok(inner.by_key.remove(&key))
    }

    /// Clone out every tracked agent.
    pub fn snapshot(&self) -> Result<Vec<Arc<Agent>>> {
        Ok(self.lock()?.by_key.values().cloned().collect())
    }

    /// Empty the registry, returning every agent for teardown.
    pub fn drain(&self) -> Result<Vec<Arc<Agent>>> {
        let mut inner = self.lock()?;
        inner.by_identity.clear();
        Ok(inner.by_key.drain().map(|(_, agent)| agent).collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.by_key.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.by_key.is_empty())
    }

    /// Diagnostic table: one `identity,peer,kind` line per entry.
    pub fn dump(&self) -> Result<String> {
        let inner = self.lock()?;
        let mut out = format!("total: {}\n", inner.by_key.len());
        for agent in inner.by_key.values() {
            let identity = agent
                .identity()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "anonymous".to_string());
            out.push_str(&format!("{},{},{}\n", identity, agent.peer(), agent.kind()));
        }
        Ok(out)
    }
}
