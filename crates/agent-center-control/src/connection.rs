//! Live agent connection state

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

use agent_center_proto::{AgentCommand, Record};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::command::{Command, CommandReceipt, DispatchError, SessionMessage};
use crate::identity::Identity;

/// Mailbox depth for outbound commands
///
/// One slot: the sender task handles one command at a time and the mailbox
/// is the only ordering mechanism.
pub const COMMAND_CHANNEL_CAPACITY: usize = 1;

/// Network interface description reported by the agent, values as sent
pub type EthInfo = BTreeMap<String, serde_json::Value>;

/// Last-known host attributes reported by the agent heartbeat
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentDetail {
    pub hostname: String,
    pub platform: String,
    pub platform_version: String,
    pub arch: String,
    pub cpu_count: Option<u32>,
    pub cpu_name: String,
    /// Total memory in bytes
    pub total_mem: Option<u64>,
    /// Total disk size in bytes
    pub total_disk: Option<u64>,
    /// Host boot time (unix seconds)
    pub boot_time: Option<i64>,
    /// Raw `last -x` output collected by the agent
    pub host_reboot_events: String,
    pub eth_infos: Vec<EthInfo>,
    /// Timestamp of the last applied heartbeat record
    pub last_heartbeat: Option<i64>,
}

impl AgentDetail {
    /// Apply an agent heartbeat record
    ///
    /// Fields absent from the record keep their previous value; fields that
    /// fail to parse are ignored.
    pub fn apply_heartbeat(&mut self, record: &Record) {
        let text = |key: &str| record.field(key).map(str::to_string);

        if let Some(v) = text("platform") {
            self.platform = v;
        }
        if let Some(v) = text("platform_version") {
            self.platform_version = v;
        }
        if let Some(v) = text("arch") {
            self.arch = v;
        }
        if let Some(v) = text("cpu_name") {
            self.cpu_name = v;
        }
        if let Some(v) = text("host_reboot_events") {
            self.host_reboot_events = v;
        }
        if let Some(v) = parse_number::<u32>(record, "cpu_count") {
            self.cpu_count = Some(v);
        }
        if let Some(v) = parse_number::<u64>(record, "total_mem") {
            self.total_mem = Some(v);
        }
        // The agent reports the disk size under `disk_count`
        if let Some(v) = parse_number::<u64>(record, "disk_count") {
            self.total_disk = Some(v);
        }
        if let Some(v) = parse_number::<i64>(record, "boot_time") {
            self.boot_time = Some(v);
        }
        if let Some(raw) = record.field("eth_infos") {
            match serde_json::from_str::<Vec<EthInfo>>(raw) {
                Ok(list) => self.eth_infos = list,
                Err(e) => debug!("Ignoring malformed eth_infos: {}", e),
            }
        }
        self.last_heartbeat = Some(record.timestamp);
    }
}

/// Numeric fields may arrive as "8", "8.0" or "1.6e10"
fn parse_number<T: TryFrom<u64> + std::str::FromStr>(record: &Record, key: &str) -> Option<T> {
    let raw = record.field(key)?.trim();
    if let Ok(v) = raw.parse::<T>() {
        return Some(v);
    }
    let float = raw.parse::<f64>().ok()?;
    if !float.is_finite() || float < 0.0 {
        return None;
    }
    T::try_from(float as u64).ok()
}

/// Construction parameters for a [`Connection`]
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub agent_id: String,
    pub tenant_auth_code: String,
    pub agent_version: String,
    pub source_addr: SocketAddr,
    pub identity: Identity,
    /// Identity resolution failed and zeroed identifiers are in use
    pub degraded_identity: bool,
}

/// Represents an active agent connection
///
/// Created by the transfer session once the handshake frame has been read;
/// the registry and reporters only hold shared references for lookup and
/// reading detail attributes.
#[derive(Debug)]
pub struct Connection {
    pub agent_id: String,
    /// Unique per session, distinguishes reconnections of the same agent
    pub session_id: Uuid,
    pub tenant_auth_code: String,
    pub tenant_id: i32,
    pub host_id: i32,
    pub degraded_identity: bool,
    pub agent_version: String,
    pub source_addr: SocketAddr,
    /// Unix seconds
    pub created_at: i64,
    command_tx: mpsc::Sender<SessionMessage>,
    cancel: CancellationToken,
    detail: RwLock<AgentDetail>,
}

impl Connection {
    pub fn new(
        info: ConnectionInfo,
        command_tx: mpsc::Sender<SessionMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent_id: info.agent_id,
            session_id: Uuid::new_v4(),
            tenant_auth_code: info.tenant_auth_code,
            tenant_id: info.identity.tenant_id,
            host_id: info.identity.host_id,
            degraded_identity: info.degraded_identity,
            agent_version: info.agent_version,
            source_addr: info.source_addr,
            created_at: chrono::Utc::now().timestamp(),
            command_tx,
            cancel,
            detail: RwLock::new(AgentDetail::default()),
        }
    }

    /// Enqueue a command for delivery
    ///
    /// Waits for a free mailbox slot. The returned receipt resolves once the
    /// sender task has written (or failed to write) the command, or once the
    /// session is torn down.
    pub async fn send_command(&self, payload: AgentCommand) -> Result<CommandReceipt, DispatchError> {
        let (command, receipt) = Command::new(payload);
        self.command_tx
            .send(SessionMessage::Deliver(command))
            .await
            .map_err(|_| DispatchError::SessionClosed)?;
        Ok(receipt)
    }

    /// Ask the sender task to close the session
    pub async fn request_close(&self) -> Result<(), DispatchError> {
        info!(agent_id = %self.agent_id, "Close requested");
        self.command_tx
            .send(SessionMessage::Close)
            .await
            .map_err(|_| DispatchError::SessionClosed)
    }

    /// Cancel the session's shared scope
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Copy of the last-known detail attributes
    pub fn detail(&self) -> AgentDetail {
        self.detail
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_detail<F>(&self, update: F)
    where
        F: FnOnce(&mut AgentDetail),
    {
        let mut detail = self.detail.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> (Connection, mpsc::Receiver<SessionMessage>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let info = ConnectionInfo {
            agent_id: "agent-1".to_string(),
            tenant_auth_code: "code".to_string(),
            agent_version: "1.7.0".to_string(),
            source_addr: "10.1.1.1:40000".parse().unwrap(),
            identity: Identity {
                tenant_id: 3,
                host_id: 9,
            },
            degraded_identity: false,
        };
        (Connection::new(info, tx, CancellationToken::new()), rx)
    }

    #[test]
    fn test_apply_heartbeat() {
        let mut detail = AgentDetail::default();
        let record = Record::new(1000, 1_700_000_000)
            .with_field("platform", "centos")
            .with_field("platform_version", "7.9")
            .with_field("arch", "x86_64")
            .with_field("cpu_count", "8")
            .with_field("cpu_name", "Xeon")
            .with_field("total_mem", "17179869184")
            .with_field("disk_count", "1.073741824e11")
            .with_field("boot_time", "1699990000")
            .with_field(
                "eth_infos",
                r#"[{"eth_name":"eth0","ipv4":"10.0.0.2","mtu":1500}]"#,
            );

        detail.apply_heartbeat(&record);

        assert_eq!(detail.platform, "centos");
        assert_eq!(detail.platform_version, "7.9");
        assert_eq!(detail.cpu_count, Some(8));
        assert_eq!(detail.total_mem, Some(17_179_869_184));
        assert_eq!(detail.total_disk, Some(107_374_182_400));
        assert_eq!(detail.boot_time, Some(1_699_990_000));
        assert_eq!(detail.eth_infos.len(), 1);
        assert_eq!(detail.eth_infos[0]["eth_name"], "eth0");
        assert_eq!(detail.eth_infos[0]["mtu"], 1500);
        assert_eq!(detail.last_heartbeat, Some(1_700_000_000));
    }

    #[test]
    fn test_apply_heartbeat_keeps_previous_values() {
        let mut detail = AgentDetail {
            platform: "debian".to_string(),
            cpu_count: Some(4),
            ..Default::default()
        };

        let record = Record::new(1000, 1)
            .with_field("cpu_count", "not-a-number")
            .with_field("eth_infos", "{broken");
        detail.apply_heartbeat(&record);

        assert_eq!(detail.platform, "debian");
        assert_eq!(detail.cpu_count, Some(4));
        assert!(detail.eth_infos.is_empty());
    }

    #[tokio::test]
    async fn test_send_command_enqueues_deliver() {
        let (conn, mut rx) = test_connection();
        let _receipt = conn.send_command(AgentCommand::control(2)).await.unwrap();

        match rx.recv().await {
            Some(SessionMessage::Deliver(command)) => {
                assert_eq!(command.payload(), &AgentCommand::control(2));
            }
            other => panic!("Expected Deliver, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_command_after_mailbox_dropped() {
        let (conn, rx) = test_connection();
        drop(rx);

        let result = conn.send_command(AgentCommand::control(1)).await;
        assert!(matches!(result, Err(DispatchError::SessionClosed)));
        assert!(matches!(
            conn.request_close().await,
            Err(DispatchError::SessionClosed)
        ));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (conn, _rx) = test_connection();
        assert!(!conn.is_closed());
        conn.cancel();
        conn.cancel();
        assert!(conn.is_closed());
        assert!(conn.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_update_detail() {
        let (conn, _rx) = test_connection();
        conn.update_detail(|d| d.hostname = "web-01".to_string());
        assert_eq!(conn.detail().hostname, "web-01");
        assert_eq!(conn.tenant_id, 3);
        assert_eq!(conn.host_id, 9);
    }
}
