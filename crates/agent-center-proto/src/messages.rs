//! Protocol frame types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single telemetry record produced by an agent or one of its plugins
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Record type (e.g. 1000 for the agent heartbeat)
    pub data_type: i32,
    /// Unix timestamp (seconds) at which the record was produced
    pub timestamp: i64,
    /// Flat key/value payload; contents are opaque to the agent center
    pub fields: HashMap<String, String>,
}

impl Record {
    pub fn new(data_type: i32, timestamp: i64) -> Self {
        Self {
            data_type,
            timestamp,
            fields: HashMap::new(),
        }
    }

    /// Builder-style field insertion
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Inbound frame (agent -> agent center)
///
/// The first frame of every stream doubles as the handshake: it must carry
/// the agent ID, tenant auth code and agent version.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentFrame {
    pub agent_id: String,
    pub tenant_auth_code: String,
    pub version: String,
    pub hostname: String,
    pub product: String,
    pub intranet_ipv4: Vec<String>,
    pub extranet_ipv4: Vec<String>,
    pub intranet_ipv6: Vec<String>,
    pub extranet_ipv6: Vec<String>,
    pub records: Vec<Record>,
}

impl AgentFrame {
    /// Create a frame carrying only the handshake identity
    pub fn handshake(
        agent_id: impl Into<String>,
        tenant_auth_code: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            tenant_auth_code: tenant_auth_code.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_record(mut self, record: Record) -> Self {
        self.records.push(record);
        self
    }
}

/// A task addressed to one of the agent's plugins
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginTask {
    pub data_type: i32,
    pub object_name: String,
    pub data: String,
    /// Correlation token echoed back by the plugin
    pub token: String,
}

/// Desired plugin configuration pushed to an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginConfig {
    pub name: String,
    pub plugin_type: String,
    pub version: String,
    pub sha256: String,
    pub signature: String,
    pub download_urls: Vec<String>,
    pub detail: String,
}

/// Outbound frame (agent center -> agent)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentCommand {
    /// Agent-level control code (0 = none)
    pub agent_ctrl: i32,
    pub task: Option<PluginTask>,
    pub configs: Vec<PluginConfig>,
}

impl AgentCommand {
    pub fn control(agent_ctrl: i32) -> Self {
        Self {
            agent_ctrl,
            ..Default::default()
        }
    }

    pub fn task(task: PluginTask) -> Self {
        Self {
            task: Some(task),
            ..Default::default()
        }
    }
}
