//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use agent_center_control::{DEFAULT_AUTH_TIMEOUT, DEFAULT_DISPATCH_TIMEOUT};
use thiserror::Error;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:6751";
pub const DEFAULT_API_LISTEN_ADDR: &str = "0.0.0.0:6752";
pub const DEFAULT_CONN_LIMIT: usize = 1500;
pub const DEFAULT_PIPELINE_BUFFER: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Connection limit must be at least 1")]
    ZeroConnLimit,

    #[error("Identity timeout must be non-zero")]
    ZeroAuthTimeout,

    #[error("Pipeline buffer must be at least 1")]
    ZeroPipelineBuffer,

    #[error("Command timeout must be non-zero")]
    ZeroCommandTimeout,

    #[error("API and agent listeners share the address {0}")]
    ListenConflict(SocketAddr),

    #[error("Manager URL must start with http:// or https://: {0}")]
    InvalidManagerUrl(String),
}

/// Agent center configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for agent streams
    pub listen_addr: SocketAddr,
    /// Listen address for the manager-facing HTTP API
    pub api_listen_addr: SocketAddr,
    /// Maximum number of simultaneously active sessions
    pub conn_limit: usize,
    /// Bound on each identity resolution call
    pub auth_timeout: Duration,
    /// Manager base URL for identity resolution and reporting
    /// If unset, every agent runs with the zeroed identity
    pub manager_url: Option<String>,
    /// Capacity of the inbound frame pipeline
    pub pipeline_buffer: usize,
    /// Default delivery bound for commands sent over the API
    pub command_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 6751)),
            api_listen_addr: SocketAddr::from(([0, 0, 0, 0], 6752)),
            conn_limit: DEFAULT_CONN_LIMIT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            manager_url: None,
            pipeline_buffer: DEFAULT_PIPELINE_BUFFER,
            command_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.conn_limit == 0 {
            return Err(ConfigError::ZeroConnLimit);
        }
        if self.auth_timeout.is_zero() {
            return Err(ConfigError::ZeroAuthTimeout);
        }
        if self.pipeline_buffer == 0 {
            return Err(ConfigError::ZeroPipelineBuffer);
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::ZeroCommandTimeout);
        }
        // Port 0 picks a free port, so two such addresses never collide
        if self.api_listen_addr == self.listen_addr && self.listen_addr.port() != 0 {
            return Err(ConfigError::ListenConflict(self.listen_addr));
        }
        if let Some(url) = &self.manager_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidManagerUrl(url.clone()));
            }
        }
        Ok(())
    }
}
