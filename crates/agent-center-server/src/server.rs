//! Agent center server implementation
//!
//! Owns the admission gate, connection registry, metrics and the shutdown
//! token, and runs one transfer session per accepted agent stream.

use std::sync::Arc;
use std::time::Duration;

use agent_center_control::{
    AdmissionGate, CommandDispatcher, ConnectionRegistry, FrameSink, IdentityResolver, Metrics,
    SessionContext, SessionError, TransferSession,
};
use agent_center_transport::{
    AgentTransport, TcpTransportListener, TransportError, TransportListener,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::api::{self, ApiState};
use crate::config::{ConfigError, ServerConfig};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("API server error: {0}")]
    Api(#[from] std::io::Error),
}

/// Agent center
pub struct AgentCenter {
    config: ServerConfig,
    gate: Arc<AdmissionGate>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    dispatcher: CommandDispatcher,
    resolver: Arc<dyn IdentityResolver>,
    sink: Arc<dyn FrameSink>,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl AgentCenter {
    /// Create a new agent center
    pub fn new(
        config: ServerConfig,
        resolver: Arc<dyn IdentityResolver>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        info!(
            "Initializing agent center (connection limit {})",
            config.conn_limit
        );

        let registry = Arc::new(ConnectionRegistry::new());
        Ok(Self {
            gate: Arc::new(AdmissionGate::new(config.conn_limit)),
            dispatcher: CommandDispatcher::new(registry.clone()),
            registry,
            metrics: Arc::new(Metrics::new()),
            resolver,
            sink,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn dispatcher(&self) -> CommandDispatcher {
        self.dispatcher.clone()
    }

    pub fn gate(&self) -> Arc<AdmissionGate> {
        self.gate.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Token cancelled on shutdown; every session token is its child
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting streams and cancel every session
    pub fn shutdown(&self) {
        info!("Shutting down agent center");
        self.shutdown.cancel();
    }

    /// Manager-facing HTTP routes over this center's registry and dispatcher
    pub fn api_router(&self) -> axum::Router {
        api::router(Arc::new(ApiState {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            metrics: self.metrics.clone(),
            command_timeout: self.config.command_timeout,
        }))
    }

    /// Bind the configured API address and serve until shutdown
    pub async fn run_api(&self) -> Result<(), ServerError> {
        let listener = tokio::net::TcpListener::bind(self.config.api_listen_addr).await?;
        api::serve_api(listener, self.api_router(), self.shutdown.clone()).await?;
        Ok(())
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            gate: self.gate.clone(),
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            sink: self.sink.clone(),
            metrics: self.metrics.clone(),
            auth_timeout: self.config.auth_timeout,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Bind the configured TCP address and serve until shutdown
    pub async fn run_tcp(&self) -> Result<(), ServerError> {
        let listener = TcpTransportListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Accept streams from `listener` until shutdown or until the listener
    /// closes, then wait for every session to finish
    pub async fn serve<L: TransportListener>(&self, listener: L) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!("🚀 Agent center listening on {}", local_addr);

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((transport, peer_addr)) => {
                    debug!("New agent stream from {}", peer_addr);
                    self.sessions
                        .spawn(run_session(self.session_context(), transport));
                }
                Err(TransportError::StreamClosed) => {
                    info!("Listener on {} closed", local_addr);
                    break;
                }
                Err(e) => {
                    error!("Failed to accept agent stream: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        self.sessions.close();
        info!(
            "Waiting for {} session(s) to finish",
            self.sessions.len()
        );
        self.sessions.wait().await;
        info!("✅ Agent center stopped");
        Ok(())
    }
}

async fn run_session<T: AgentTransport>(ctx: SessionContext, transport: T) {
    let peer_addr = transport.remote_address();
    match TransferSession::new(ctx, transport).run().await {
        Ok(summary) => info!(
            agent_id = %summary.agent_id,
            session_id = %summary.session_id,
            "Session ended after {:?}: {}",
            summary.duration,
            summary.reason
        ),
        Err(SessionError::AdmissionRejected) | Err(SessionError::Shutdown) => {}
        Err(e) => warn!("Session from {} failed: {}", peer_addr, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_center_control::{DetailIngestor, DisabledIdentityResolver};
    use agent_center_proto::{AgentCommand, AgentFrame};
    use agent_center_transport::memory;

    fn center(conn_limit: usize) -> Arc<AgentCenter> {
        let config = ServerConfig {
            conn_limit,
            auth_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        Arc::new(
            AgentCenter::new(
                config,
                Arc::new(DisabledIdentityResolver),
                Arc::new(DetailIngestor::without_pipeline()),
            )
            .unwrap(),
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ServerConfig {
            conn_limit: 0,
            ..Default::default()
        };
        let result = AgentCenter::new(
            config,
            Arc::new(DisabledIdentityResolver),
            Arc::new(DetailIngestor::without_pipeline()),
        );
        assert!(matches!(
            result,
            Err(ServerError::Config(ConfigError::ZeroConnLimit))
        ));
    }

    #[tokio::test]
    async fn test_serve_memory_listener() {
        let center = center(4);
        let (listener, connector) = memory::listener("127.0.0.1:6751".parse().unwrap());

        let server = {
            let center = center.clone();
            tokio::spawn(async move { center.serve(listener).await })
        };

        let mut peer = connector.connect("10.3.0.1:40000".parse().unwrap()).unwrap();
        peer.send_frame(AgentFrame::handshake("agent-1", "code", "1.7.0"));

        let registry = center.registry();
        wait_for(|| registry.contains("agent-1")).await;
        let connection = registry.get("agent-1").unwrap();
        assert!(connection.degraded_identity);

        center
            .dispatcher()
            .dispatch("agent-1", AgentCommand::control(2), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(peer.recv_command().await, Some(AgentCommand::control(2)));

        center.shutdown();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(center.registry().is_empty());
        assert_eq!(center.gate().available(), 4);
        // The writer is gone once the session stopped
        assert!(peer.recv_command().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_listener_drains_sessions() {
        let center = center(2);
        let (listener, connector) = memory::listener("127.0.0.1:6751".parse().unwrap());

        let server = {
            let center = center.clone();
            tokio::spawn(async move { center.serve(listener).await })
        };

        let mut peer = connector.connect("10.3.0.1:40000".parse().unwrap()).unwrap();
        peer.send_frame(AgentFrame::handshake("agent-1", "code", "1.7.0"));
        let registry = center.registry();
        wait_for(|| registry.contains("agent-1")).await;

        // No more streams; the server waits for the open session
        drop(connector);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_finished());

        peer.close();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(center.registry().is_empty());
    }
}
