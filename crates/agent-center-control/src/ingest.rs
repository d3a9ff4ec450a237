//! Inbound frame ingestion
//!
//! Every frame received from an agent is handed to a [`FrameSink`] together
//! with the owning connection. The receiver task awaits the sink before
//! reading the next frame, so sinks must not block for long.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agent_center_proto::{AgentFrame, AGENT_HEARTBEAT_DATA_TYPE};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::connection::Connection;

/// Consumer of inbound agent frames
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn ingest(&self, frame: AgentFrame, connection: &Arc<Connection>);
}

/// A frame tagged with the identity of the connection it arrived on
#[derive(Debug, Clone)]
pub struct IngestedFrame {
    pub agent_id: String,
    pub tenant_id: i32,
    pub host_id: i32,
    pub source_addr: SocketAddr,
    /// Unix seconds
    pub received_at: i64,
    pub frame: AgentFrame,
}

/// Default sink: keeps connection detail current and forwards frames
///
/// Heartbeat records update the connection's detail attributes. Every frame
/// is then offered to the processing pipeline without waiting; when the
/// pipeline is full the frame is dropped and counted.
#[derive(Debug)]
pub struct DetailIngestor {
    pipeline: Option<mpsc::Sender<IngestedFrame>>,
    dropped: AtomicU64,
}

impl DetailIngestor {
    pub fn new(pipeline: mpsc::Sender<IngestedFrame>) -> Self {
        Self {
            pipeline: Some(pipeline),
            dropped: AtomicU64::new(0),
        }
    }

    /// Ingestor that only maintains connection detail
    pub fn without_pipeline() -> Self {
        Self {
            pipeline: None,
            dropped: AtomicU64::new(0),
        }
    }

    /// Frames dropped because the pipeline was full or gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSink for DetailIngestor {
    async fn ingest(&self, frame: AgentFrame, connection: &Arc<Connection>) {
        let heartbeats: Vec<_> = frame
            .records
            .iter()
            .filter(|record| record.data_type == AGENT_HEARTBEAT_DATA_TYPE)
            .collect();

        if !heartbeats.is_empty() || !frame.hostname.is_empty() {
            connection.update_detail(|detail| {
                if !frame.hostname.is_empty() {
                    detail.hostname = frame.hostname.clone();
                }
                for record in &heartbeats {
                    detail.apply_heartbeat(record);
                }
            });
        }

        let Some(ref pipeline) = self.pipeline else {
            return;
        };

        let ingested = IngestedFrame {
            agent_id: connection.agent_id.clone(),
            tenant_id: connection.tenant_id,
            host_id: connection.host_id,
            source_addr: connection.source_addr,
            received_at: chrono::Utc::now().timestamp(),
            frame,
        };

        match pipeline.try_send(ingested) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(agent_id = %connection.agent_id, "Pipeline full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(agent_id = %connection.agent_id, "Pipeline closed, dropping frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SessionMessage;
    use crate::connection::{ConnectionInfo, COMMAND_CHANNEL_CAPACITY};
    use crate::identity::Identity;
    use agent_center_proto::Record;
    use tokio_util::sync::CancellationToken;

    fn connection() -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel::<SessionMessage>(COMMAND_CHANNEL_CAPACITY);
        Arc::new(Connection::new(
            ConnectionInfo {
                agent_id: "agent-1".to_string(),
                tenant_auth_code: "code".to_string(),
                agent_version: "1.0.0".to_string(),
                source_addr: "10.0.0.1:5000".parse().unwrap(),
                identity: Identity {
                    tenant_id: 7,
                    host_id: 70,
                },
                degraded_identity: false,
            },
            tx,
            CancellationToken::new(),
        ))
    }

    fn heartbeat_frame() -> AgentFrame {
        let mut frame = AgentFrame::handshake("agent-1", "code", "1.0.0")
            .with_record(Record::new(AGENT_HEARTBEAT_DATA_TYPE, 100).with_field("arch", "aarch64"))
            .with_record(Record::new(5000, 101).with_field("exe", "/bin/sh"));
        frame.hostname = "db-01".to_string();
        frame
    }

    #[tokio::test]
    async fn test_heartbeat_updates_detail_and_forwards() {
        let (tx, mut rx) = mpsc::channel(4);
        let ingestor = DetailIngestor::new(tx);
        let conn = connection();

        ingestor.ingest(heartbeat_frame(), &conn).await;

        let detail = conn.detail();
        assert_eq!(detail.arch, "aarch64");
        assert_eq!(detail.hostname, "db-01");
        assert_eq!(detail.last_heartbeat, Some(100));

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.agent_id, "agent-1");
        assert_eq!(forwarded.tenant_id, 7);
        assert_eq!(forwarded.host_id, 70);
        assert_eq!(forwarded.frame.records.len(), 2);
    }

    #[tokio::test]
    async fn test_full_pipeline_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let ingestor = DetailIngestor::new(tx);
        let conn = connection();

        ingestor.ingest(heartbeat_frame(), &conn).await;
        ingestor.ingest(heartbeat_frame(), &conn).await;
        ingestor.ingest(heartbeat_frame(), &conn).await;

        assert_eq!(ingestor.dropped(), 2);
    }

    #[tokio::test]
    async fn test_without_pipeline_only_updates_detail() {
        let ingestor = DetailIngestor::without_pipeline();
        let conn = connection();

        ingestor.ingest(heartbeat_frame(), &conn).await;
        assert_eq!(conn.detail().arch, "aarch64");
        assert_eq!(ingestor.dropped(), 0);
    }
}
