//! Manager-facing HTTP API
//!
//! - `POST /command/{agent_id}` writes a command to a connected agent
//! - `POST /conn/{agent_id}/close` closes an agent's session
//! - `GET /conn/list` lists connected agents
//! - `GET /metrics` returns the global counters

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agent_center_control::{
    CommandDispatcher, Connection, ConnectionRegistry, DispatchError, Metrics, MetricsSnapshot,
};
use agent_center_proto::{AgentCommand, PluginConfig, PluginTask};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared state of the API handlers
pub struct ApiState {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: CommandDispatcher,
    pub metrics: Arc<Metrics>,
    /// Delivery bound used when a request does not name one
    pub command_timeout: Duration,
}

/// Command written to the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub agent_ctrl: i32,
    #[serde(default)]
    pub task: Option<PluginTask>,
    #[serde(default)]
    pub configs: Vec<PluginConfig>,
    /// Overrides the server's delivery timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CommandRequest {
    fn into_command(self) -> AgentCommand {
        AgentCommand {
            agent_ctrl: self.agent_ctrl,
            task: self.task,
            configs: self.configs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub agent_id: String,
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseResponse {
    pub agent_id: String,
    pub closing: bool,
}

/// Connected agent as seen by the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionView {
    pub agent_id: String,
    pub session_id: String,
    pub tenant_id: i32,
    pub host_id: i32,
    pub degraded_identity: bool,
    pub agent_version: String,
    pub source_addr: String,
    /// Unix seconds
    pub created_at: i64,
    pub hostname: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
}

impl From<&Connection> for ConnectionView {
    fn from(connection: &Connection) -> Self {
        let detail = connection.detail();
        Self {
            agent_id: connection.agent_id.clone(),
            session_id: connection.session_id.to_string(),
            tenant_id: connection.tenant_id,
            host_id: connection.host_id,
            degraded_identity: connection.degraded_identity,
            agent_version: connection.agent_version.clone(),
            source_addr: connection.source_addr.to_string(),
            created_at: connection.created_at,
            hostname: detail.hostname,
            platform: detail.platform,
            last_heartbeat: detail.last_heartbeat,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionList {
    pub connections: Vec<ConnectionView>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, error: String, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error,
            code: Some(code.to_string()),
        }),
    )
}

fn dispatch_error(e: DispatchError) -> ApiError {
    let (status, code) = match &e {
        DispatchError::AgentNotFound(_) => (StatusCode::NOT_FOUND, "AGENT_NOT_FOUND"),
        DispatchError::SessionClosed => (StatusCode::GONE, "SESSION_CLOSED"),
        DispatchError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "DISPATCH_TIMEOUT"),
        DispatchError::Transport(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
    };
    error_response(status, e.to_string(), code)
}

/// Write a command to a connected agent
pub async fn post_command(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let timeout = match request.timeout_ms {
        Some(0) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "timeout_ms must be non-zero".to_string(),
                "INVALID_TIMEOUT",
            ))
        }
        Some(ms) => Duration::from_millis(ms),
        None => state.command_timeout,
    };
    debug!(agent_id = %agent_id, "Dispatching command with timeout {:?}", timeout);

    state
        .dispatcher
        .dispatch(&agent_id, request.into_command(), timeout)
        .await
        .map_err(dispatch_error)?;

    Ok(Json(CommandResponse {
        agent_id,
        delivered: true,
    }))
}

/// Ask an agent's session to close
pub async fn close_connection(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<CloseResponse>, ApiError> {
    info!(agent_id = %agent_id, "Close requested over the API");
    state
        .dispatcher
        .close(&agent_id, state.command_timeout)
        .await
        .map_err(dispatch_error)?;

    Ok(Json(CloseResponse {
        agent_id,
        closing: true,
    }))
}

/// List connected agents, ordered by agent ID
pub async fn list_connections(State(state): State<Arc<ApiState>>) -> Json<ConnectionList> {
    let mut connections: Vec<ConnectionView> = state
        .registry
        .snapshot()
        .iter()
        .map(|c| ConnectionView::from(c.as_ref()))
        .collect();
    connections.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

    let total = connections.len();
    Json(ConnectionList { connections, total })
}

pub async fn get_metrics(State(state): State<Arc<ApiState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/command/{agent_id}", post(post_command))
        .route("/conn/list", get(list_connections))
        .route("/conn/{agent_id}/close", post(close_connection))
        .route("/metrics", get(get_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve `router` on `listener` until `shutdown` is cancelled
pub async fn serve_api(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let local_addr: SocketAddr = listener.local_addr()?;
    info!("Manager API listening on {}", local_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Manager API on {} stopped", local_addr);
    Ok(())
}
