//! Connection registry for tracking connected agents
//!
//! Maps each agent ID to its live [`Connection`]. The registry is read and
//! written by every session plus periodic snapshot readers, so it is backed
//! by a sharded `DashMap`: each operation only locks one shard, and only for
//! the duration of the map operation itself.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::Connection;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Agent {0} is already connected")]
    DuplicateKey(String),
}

/// Registry of live agent connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its agent ID
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if a live connection is already registered for
    /// the same agent. The existing entry is left untouched. An entry whose
    /// session is already closing is not live and gets replaced.
    pub fn add(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        match self.connections.entry(connection.agent_id.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_closed() {
                    warn!(
                        agent_id = %connection.agent_id,
                        existing_addr = %existing.get().source_addr,
                        new_addr = %connection.source_addr,
                        "Agent is already connected"
                    );
                    return Err(RegistryError::DuplicateKey(connection.agent_id.clone()));
                }
                info!(
                    agent_id = %connection.agent_id,
                    "Replacing connection of a closing session"
                );
                existing.insert(connection);
            }
            Entry::Vacant(slot) => {
                info!(
                    agent_id = %connection.agent_id,
                    source_addr = %connection.source_addr,
                    tenant_id = connection.tenant_id,
                    host_id = connection.host_id,
                    "Registered agent connection"
                );
                slot.insert(connection);
            }
        }
        Ok(())
    }

    /// Remove an agent's entry
    ///
    /// Idempotent: removing an absent agent is not an error.
    pub fn delete(&self, agent_id: &str) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(agent_id).map(|(_, conn)| conn);
        if removed.is_some() {
            info!(agent_id = %agent_id, "Unregistered agent connection");
        } else {
            debug!(agent_id = %agent_id, "Agent connection already unregistered");
        }
        removed
    }

    /// Remove `connection` only if it is still the registered entry
    ///
    /// Sessions use this on teardown so that a late teardown never evicts a
    /// newer session of the same agent.
    pub fn remove_connection(&self, connection: &Connection) -> bool {
        let removed = self
            .connections
            .remove_if(&connection.agent_id, |_, current| {
                current.session_id == connection.session_id
            })
            .is_some();
        if removed {
            info!(agent_id = %connection.agent_id, "Unregistered agent connection");
        }
        removed
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.connections.contains_key(agent_id)
    }

    /// Point-in-time copy of all registered connections
    ///
    /// Shards are visited one at a time, so concurrent `add`/`delete` calls
    /// are never blocked for longer than one shard copy.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
