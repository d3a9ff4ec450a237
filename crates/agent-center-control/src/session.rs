//! Transfer session: the lifecycle of one agent stream
//!
//! ```text
//! Init ──admission──▶ Authenticating ──first frame + identity──▶ Active
//!   │                      │                                       │
//!   └─rejected             └─stream closed                         │ receiver/sender exit
//!                                                                  ▼
//!                                          Closed ◀── Closing (cancel, unregister, release)
//! ```
//!
//! While active, two tasks share the connection's cancellation token: the
//! receiver feeds inbound frames to the sink, the sender drains the command
//! mailbox onto the stream. Whichever stops first cancels the token, the
//! other observes it and stops, and teardown runs exactly once after both
//! have exited.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_center_proto::AgentFrame;
use agent_center_transport::{AgentTransport, FrameReader, FrameWriter, TransportError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionGate;
use crate::command::SessionMessage;
use crate::connection::{Connection, ConnectionInfo, COMMAND_CHANNEL_CAPACITY};
use crate::identity::{ConnAuthRequest, Identity, IdentityError, IdentityResolver};
use crate::ingest::FrameSink;
use crate::metrics::{AgentCounters, Metrics};
use crate::registry::{ConnectionRegistry, RegistryError};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Out of max connection limit")]
    AdmissionRejected,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Logged when identity resolution fails; the session continues
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(#[from] IdentityError),

    #[error("Agent {0} is already connected")]
    DuplicateConnection(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Server shutting down")]
    Shutdown,
}

/// Why an active session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The shared token was cancelled from outside (server shutdown)
    Cancelled,
    /// The agent closed its side of the stream
    RemoteClosed,
    ReceiveFailed(String),
    SendFailed(String),
    /// A close was requested through the command mailbox
    CloseRequested,
    /// Every mailbox handle was dropped
    MailboxClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Cancelled => f.write_str("cancelled"),
            CloseReason::RemoteClosed => f.write_str("remote closed the stream"),
            CloseReason::ReceiveFailed(e) => write!(f, "receive failed: {}", e),
            CloseReason::SendFailed(e) => write!(f, "send failed: {}", e),
            CloseReason::CloseRequested => f.write_str("close requested"),
            CloseReason::MailboxClosed => f.write_str("command mailbox closed"),
        }
    }
}

/// Outcome of a session that reached the active state
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub agent_id: String,
    pub session_id: Uuid,
    pub reason: CloseReason,
    pub duration: Duration,
}

/// Shared collaborators for all sessions
#[derive(Clone)]
pub struct SessionContext {
    pub gate: Arc<AdmissionGate>,
    pub registry: Arc<ConnectionRegistry>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub sink: Arc<dyn FrameSink>,
    pub metrics: Arc<Metrics>,
    /// Bound on the identity resolver call
    pub auth_timeout: Duration,
    /// Parent of every session's cancellation token
    pub shutdown: CancellationToken,
}

/// One agent stream from admission to teardown
pub struct TransferSession<T: AgentTransport> {
    ctx: SessionContext,
    transport: T,
    peer_addr: SocketAddr,
}

impl<T: AgentTransport> TransferSession<T> {
    pub fn new(ctx: SessionContext, transport: T) -> Self {
        let peer_addr = transport.remote_address();
        Self {
            ctx,
            transport,
            peer_addr,
        }
    }

    /// Drive the session to completion
    pub async fn run(self) -> Result<SessionSummary, SessionError> {
        let TransferSession {
            ctx,
            transport,
            peer_addr,
        } = self;
        let mut state = SessionState::Init;

        // Released on every return below
        let Some(admission) = ctx.gate.try_acquire() else {
            ctx.metrics.record_rejected();
            warn!(peer = %peer_addr, "Out of max connection limit, rejecting stream");
            return Err(SessionError::AdmissionRejected);
        };
        ctx.metrics.record_admitted();

        advance(&mut state, SessionState::Authenticating, peer_addr);
        let (mut reader, writer) = transport.into_split();

        let first = tokio::select! {
            _ = ctx.shutdown.cancelled() => return Err(SessionError::Shutdown),
            result = reader.recv_frame() => match result? {
                Some(frame) => frame,
                None => {
                    return Err(SessionError::Handshake(
                        "stream closed before the first frame".to_string(),
                    ))
                }
            },
        };
        if first.agent_id.is_empty() {
            return Err(SessionError::Handshake(
                "first frame carries no agent id".to_string(),
            ));
        }
        info!(
            agent_id = %first.agent_id,
            peer = %peer_addr,
            version = %first.version,
            "Agent handshake received"
        );

        let (identity, degraded_identity) = resolve_identity(&ctx, &first, peer_addr).await;

        let cancel = ctx.shutdown.child_token();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let connection = Arc::new(Connection::new(
            ConnectionInfo {
                agent_id: first.agent_id.clone(),
                tenant_auth_code: first.tenant_auth_code.clone(),
                agent_version: first.version.clone(),
                source_addr: peer_addr,
                identity,
                degraded_identity,
            },
            command_tx,
            cancel.clone(),
        ));

        if let Err(RegistryError::DuplicateKey(agent_id)) = ctx.registry.add(connection.clone()) {
            // Closing without touching the registered session
            advance(&mut state, SessionState::Closing, peer_addr);
            ctx.metrics.record_duplicate();
            cancel.cancel();
            drop(admission);
            warn!(agent_id = %agent_id, peer = %peer_addr, "Rejecting duplicate connection");
            return Err(SessionError::DuplicateConnection(agent_id));
        }

        advance(&mut state, SessionState::Active, peer_addr);
        let started = Instant::now();
        let agent_id = connection.agent_id.clone();
        let counters = ctx.metrics.register_agent(&agent_id);
        info!(
            agent_id = %agent_id,
            session_id = %connection.session_id,
            tenant_id = connection.tenant_id,
            host_id = connection.host_id,
            "✅ Agent session active"
        );

        ctx.metrics.record_received(&counters);
        ctx.sink.ingest(first, &connection).await;

        let receiver = tokio::spawn(receive_loop(
            reader,
            connection.clone(),
            ctx.sink.clone(),
            ctx.metrics.clone(),
            counters.clone(),
        ));
        let sender = tokio::spawn(send_loop(
            writer,
            command_rx,
            connection.clone(),
            ctx.metrics.clone(),
            counters.clone(),
        ));

        let (received, sent) = tokio::join!(receiver, sender);

        advance(&mut state, SessionState::Closing, peer_addr);
        cancel.cancel();
        let reason = first_reason(received, sent);
        ctx.registry.remove_connection(&connection);
        ctx.metrics.release_agent(&agent_id, &counters);
        drop(admission);
        advance(&mut state, SessionState::Closed, peer_addr);

        info!(
            agent_id = %agent_id,
            session_id = %connection.session_id,
            "Agent session closed: {}",
            reason
        );

        Ok(SessionSummary {
            agent_id,
            session_id: connection.session_id,
            reason,
            duration: started.elapsed(),
        })
    }
}

fn advance(state: &mut SessionState, next: SessionState, peer_addr: SocketAddr) {
    debug!(peer = %peer_addr, "Session {} -> {}", state, next);
    *state = next;
}

/// Fail-open identity resolution
///
/// Resolver failure, timeout or rejection all yield the zeroed identity and
/// the session continues.
async fn resolve_identity(
    ctx: &SessionContext,
    first: &AgentFrame,
    peer_addr: SocketAddr,
) -> (Identity, bool) {
    let request = ConnAuthRequest {
        tenant_auth_code: first.tenant_auth_code.clone(),
        agent_id: first.agent_id.clone(),
        agent_version: first.version.clone(),
        ext_ip: peer_addr.to_string(),
    };

    let result = match tokio::time::timeout(ctx.auth_timeout, ctx.resolver.resolve(&request)).await
    {
        Ok(result) => result,
        Err(_) => Err(IdentityError::Timeout(ctx.auth_timeout)),
    };

    match result {
        Ok(identity) => {
            info!(agent_id = %first.agent_id, "Identity resolved");
            (identity, false)
        }
        Err(e) => {
            let e = SessionError::from(e);
            warn!(
                agent_id = %first.agent_id,
                tenant_auth_code = %first.tenant_auth_code,
                "{}, continuing with tenant 0 / host 0",
                e
            );
            (Identity::degraded(), true)
        }
    }
}

/// The reason reported by whichever task stopped on its own
fn first_reason(
    received: Result<Option<CloseReason>, JoinError>,
    sent: Result<Option<CloseReason>, JoinError>,
) -> CloseReason {
    let received = received.unwrap_or_else(|e| {
        error!("Receiver task failed: {}", e);
        Some(CloseReason::ReceiveFailed(e.to_string()))
    });
    let sent = sent.unwrap_or_else(|e| {
        error!("Sender task failed: {}", e);
        Some(CloseReason::SendFailed(e.to_string()))
    });
    received.or(sent).unwrap_or(CloseReason::Cancelled)
}

/// Receive frames until the stream fails or the session is cancelled
///
/// Returns `None` when it stopped because of the shared token.
async fn receive_loop<R: FrameReader>(
    mut reader: R,
    connection: Arc<Connection>,
    sink: Arc<dyn FrameSink>,
    metrics: Arc<Metrics>,
    counters: Arc<AgentCounters>,
) -> Option<CloseReason> {
    let cancel = connection.cancellation_token();
    let _guard = cancel.clone().drop_guard();

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(
                    agent_id = %connection.agent_id,
                    "Send direction closed, stopping receive direction"
                );
                return None;
            }
            result = reader.recv_frame() => result,
        };

        match result {
            Ok(Some(frame)) => {
                metrics.record_received(&counters);
                sink.ingest(frame, &connection).await;
            }
            Ok(None) => {
                info!(agent_id = %connection.agent_id, "Agent closed the stream");
                return Some(CloseReason::RemoteClosed);
            }
            Err(e) => {
                error!(agent_id = %connection.agent_id, "Receive error: {}", e);
                return Some(CloseReason::ReceiveFailed(e.to_string()));
            }
        }
    }
}

/// Write mailbox commands until the stream fails, a close is requested or
/// the session is cancelled
async fn send_loop<W: FrameWriter>(
    mut writer: W,
    mut mailbox: mpsc::Receiver<SessionMessage>,
    connection: Arc<Connection>,
    metrics: Arc<Metrics>,
    counters: Arc<AgentCounters>,
) -> Option<CloseReason> {
    let cancel = connection.cancellation_token();
    let _guard = cancel.clone().drop_guard();

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(
                    agent_id = %connection.agent_id,
                    "Receive direction closed, stopping send direction"
                );
                return None;
            }
            message = mailbox.recv() => message,
        };

        let command = match message {
            Some(SessionMessage::Deliver(command)) => command,
            Some(SessionMessage::Close) => {
                info!(agent_id = %connection.agent_id, "Close signal received");
                return Some(CloseReason::CloseRequested);
            }
            None => return Some(CloseReason::MailboxClosed),
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                command.complete(Err(TransportError::StreamClosed));
                return None;
            }
            result = writer.send_frame(command.payload()) => result,
        };

        match result {
            Ok(()) => {
                metrics.record_sent(&counters);
                debug!(agent_id = %connection.agent_id, "Command sent: {:?}", command.payload());
                command.complete(Ok(()));
            }
            Err(e) => {
                metrics.record_send_failure();
                error!(agent_id = %connection.agent_id, "Send error: {}", e);
                let reason = CloseReason::SendFailed(e.to_string());
                command.complete(Err(e));
                return Some(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MockIdentityResolver;
    use crate::ingest::DetailIngestor;
    use agent_center_proto::AgentCommand;
    use agent_center_transport::memory::{self, MemoryPeer, MemoryTransport};

    fn context(capacity: usize, resolver: MockIdentityResolver) -> SessionContext {
        SessionContext {
            gate: Arc::new(AdmissionGate::new(capacity)),
            registry: Arc::new(ConnectionRegistry::new()),
            resolver: Arc::new(resolver),
            sink: Arc::new(DetailIngestor::without_pipeline()),
            metrics: Arc::new(Metrics::new()),
            auth_timeout: Duration::from_millis(200),
            shutdown: CancellationToken::new(),
        }
    }

    fn resolving_to(tenant_id: i32, host_id: i32) -> MockIdentityResolver {
        let mut resolver = MockIdentityResolver::new();
        resolver
            .expect_resolve()
            .returning(move |_| Ok(Identity { tenant_id, host_id }));
        resolver
    }

    fn stream(agent_id: &str) -> (MemoryTransport, MemoryPeer) {
        let (transport, peer) = memory::pair("10.2.0.1:41000".parse().unwrap());
        peer.send_frame(AgentFrame::handshake(agent_id, "tenant-code", "1.7.0"));
        (transport, peer)
    }

    async fn wait_for_agent(registry: &ConnectionRegistry, agent_id: &str) -> Arc<Connection> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(conn) = registry.get(agent_id) {
                    return conn;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("agent never registered")
    }

    #[tokio::test]
    async fn test_rejected_when_gate_full() {
        let ctx = context(0, MockIdentityResolver::new());
        let (transport, _peer) = stream("agent-1");

        let result = TransferSession::new(ctx.clone(), transport).run().await;

        assert!(matches!(result, Err(SessionError::AdmissionRejected)));
        assert!(ctx.registry.is_empty());
        assert_eq!(ctx.metrics.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_handshake_resolves_identity() {
        let mut resolver = MockIdentityResolver::new();
        resolver
            .expect_resolve()
            .withf(|req| {
                req.agent_id == "agent-1"
                    && req.tenant_auth_code == "tenant-code"
                    && req.agent_version == "1.7.0"
                    && req.ext_ip == "10.2.0.1:41000"
            })
            .times(1)
            .returning(|_| {
                Ok(Identity {
                    tenant_id: 5,
                    host_id: 50,
                })
            });
        let ctx = context(1, resolver);
        let (transport, mut peer) = stream("agent-1");

        let session = tokio::spawn(TransferSession::new(ctx.clone(), transport).run());
        let conn = wait_for_agent(&ctx.registry, "agent-1").await;
        assert_eq!(conn.tenant_id, 5);
        assert_eq!(conn.host_id, 50);
        assert!(!conn.degraded_identity);
        assert_eq!(ctx.gate.available(), 0);

        peer.close();
        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::RemoteClosed);
        assert!(ctx.registry.is_empty());
        assert_eq!(ctx.gate.available(), 1);
    }

    #[tokio::test]
    async fn test_resolver_error_fails_open() {
        let mut resolver = MockIdentityResolver::new();
        resolver.expect_resolve().returning(|_| {
            Err(IdentityError::Rejected {
                status: 403,
                msg: "unknown tenant".to_string(),
            })
        });
        let ctx = context(1, resolver);
        let (transport, mut peer) = stream("agent-1");

        let session = tokio::spawn(TransferSession::new(ctx.clone(), transport).run());
        let conn = wait_for_agent(&ctx.registry, "agent-1").await;
        assert_eq!(conn.tenant_id, 0);
        assert_eq!(conn.host_id, 0);
        assert!(conn.degraded_identity);

        peer.close();
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_agent_id_is_handshake_error() {
        let ctx = context(1, MockIdentityResolver::new());
        let (transport, _peer) = stream("");

        let result = TransferSession::new(ctx.clone(), transport).run().await;
        assert!(matches!(result, Err(SessionError::Handshake(_))));
        assert_eq!(ctx.gate.available(), 1);
    }

    #[tokio::test]
    async fn test_stream_closed_before_handshake() {
        let ctx = context(1, MockIdentityResolver::new());
        let (transport, mut peer) = memory::pair("10.2.0.1:41000".parse().unwrap());
        peer.close();

        let result = TransferSession::new(ctx.clone(), transport).run().await;
        assert!(matches!(result, Err(SessionError::Handshake(_))));
        assert_eq!(ctx.gate.available(), 1);
    }

    #[tokio::test]
    async fn test_close_request_ends_session() {
        let ctx = context(1, resolving_to(1, 1));
        let (transport, mut peer) = stream("agent-1");

        let session = tokio::spawn(TransferSession::new(ctx.clone(), transport).run());
        let conn = wait_for_agent(&ctx.registry, "agent-1").await;
        conn.request_close().await.unwrap();

        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::CloseRequested);
        assert!(conn.is_closed());
        assert!(ctx.registry.is_empty());
        // Writer dropped once the sender task exited
        assert!(peer.recv_command().await.is_none());
    }

    #[tokio::test]
    async fn test_send_failure_completes_command_and_tears_down() {
        let ctx = context(1, resolving_to(1, 1));
        let (transport, peer) = stream("agent-1");

        let session = tokio::spawn(TransferSession::new(ctx.clone(), transport).run());
        let conn = wait_for_agent(&ctx.registry, "agent-1").await;

        peer.fail_sends(true);
        let receipt = conn.send_command(AgentCommand::control(1)).await.unwrap();
        let outcome = receipt.wait().await;
        assert!(matches!(
            outcome,
            Err(crate::command::DispatchError::Transport(_))
        ));

        let summary = session.await.unwrap().unwrap();
        assert!(matches!(summary.reason, CloseReason::SendFailed(_)));
        assert_eq!(ctx.metrics.snapshot().send_failures, 1);
        assert_eq!(ctx.gate.available(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_session() {
        let ctx = context(1, resolving_to(1, 1));
        let (transport, _peer) = stream("agent-1");

        let session = tokio::spawn(TransferSession::new(ctx.clone(), transport).run());
        wait_for_agent(&ctx.registry, "agent-1").await;

        ctx.shutdown.cancel();
        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::Cancelled);
        assert!(ctx.registry.is_empty());
        assert_eq!(ctx.metrics.snapshot().tracked_agents, 0);
    }

    #[tokio::test]
    async fn test_frames_are_counted() {
        let ctx = context(1, resolving_to(1, 1));
        let (transport, mut peer) = stream("agent-1");

        let session = tokio::spawn(TransferSession::new(ctx.clone(), transport).run());
        wait_for_agent(&ctx.registry, "agent-1").await;

        peer.send_frame(AgentFrame::handshake("agent-1", "tenant-code", "1.7.0"));
        peer.send_frame(AgentFrame::handshake("agent-1", "tenant-code", "1.7.0"));
        peer.close();

        session.await.unwrap().unwrap();
        // Handshake frame plus two more
        assert_eq!(ctx.metrics.snapshot().frames_received, 3);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Authenticating.to_string(), "authenticating");
        assert_eq!(
            CloseReason::SendFailed("reset".to_string()).to_string(),
            "send failed: reset"
        );
    }
}
