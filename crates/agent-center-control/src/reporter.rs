//! Periodic basic-info report of every connected agent to the manager

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{AgentDetail, Connection, EthInfo};
use crate::registry::ConnectionRegistry;

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

const BASIC_INFO_PATH: &str = "/agent/report/heartBeat/basicInfo";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const LAST_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";
const MIN_LAST_FIELDS: usize = 6;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const STATE_ONLINE: i32 = 1;

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Manager base URL (e.g. "http://manager:6701")
    pub manager_url: String,
    pub interval: Duration,
    /// Bound on each report request
    pub request_timeout: Duration,
}

impl ReporterConfig {
    pub fn new(manager_url: impl Into<String>) -> Self {
        Self {
            manager_url: manager_url.into(),
            interval: DEFAULT_REPORT_INTERVAL,
            request_timeout: DEFAULT_REPORT_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Reboot or shutdown event parsed from the agent's `last -x` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebootEvent {
    pub event: String,
    pub event_time: String,
    pub status: String,
}

/// Per-agent payload of the basic-info report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicInfoReport {
    pub tenant_id: i32,
    pub host_id: i32,
    pub os: String,
    pub cpu_count: Option<u32>,
    pub cpu_name: String,
    pub mem_size: String,
    pub disk_size: String,
    pub state: i32,
    pub startup_time: String,
    pub host_reboot_events: Vec<RebootEvent>,
    pub eth_info: Vec<EthInfo>,
}

impl BasicInfoReport {
    pub fn from_connection(connection: &Connection) -> Self {
        Self::from_detail(connection.tenant_id, connection.host_id, &connection.detail())
    }

    pub fn from_detail(tenant_id: i32, host_id: i32, detail: &AgentDetail) -> Self {
        let eth_info = detail
            .eth_infos
            .iter()
            .map(|eth| {
                eth.iter()
                    .map(|(k, v)| {
                        let key = if k == "eth_name" { "ethName" } else { k.as_str() };
                        (key.to_string(), v.clone())
                    })
                    .collect()
            })
            .collect();

        Self {
            tenant_id,
            host_id,
            os: format!(
                "{} {} {}",
                detail.platform, detail.platform_version, detail.arch
            ),
            cpu_count: detail.cpu_count,
            cpu_name: detail.cpu_name.clone(),
            mem_size: gigabytes(detail.total_mem),
            disk_size: gigabytes(detail.total_disk),
            state: STATE_ONLINE,
            startup_time: format_unix(detail.boot_time.unwrap_or(0)),
            host_reboot_events: parse_reboot_events(&detail.host_reboot_events),
            eth_info,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    status: i32,
    #[serde(default)]
    msg: String,
}

fn gigabytes(bytes: Option<u64>) -> String {
    format!("{:.2}G", bytes.unwrap_or(0) as f64 / GIB)
}

fn format_unix(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format(TIME_FORMAT)
        .to_string()
}

/// Parse `last -x --time-format iso` output
///
/// A line is kept when it has at least six fields, a kernel release
/// (`3.` to `6.` prefix containing `-`) and both a start and an end
/// timestamp. Open sessions ("still running"), runlevel lines and the
/// trailing `wtmp begins` line are skipped.
pub fn parse_reboot_events(raw: &str) -> Vec<RebootEvent> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("runlevel"))
        .filter_map(parse_reboot_line)
        .collect()
}

fn parse_reboot_line(line: &str) -> Option<RebootEvent> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < MIN_LAST_FIELDS {
        return None;
    }
    if !fields.iter().any(|f| is_kernel_release(f)) {
        return None;
    }

    let mut timestamps = fields
        .iter()
        .filter_map(|f| DateTime::parse_from_str(f, LAST_TIME_FORMAT).ok());
    let started = timestamps.next()?;
    timestamps.next()?;

    Some(RebootEvent {
        event: fields[0].to_string(),
        event_time: started.format(TIME_FORMAT).to_string(),
        status: String::new(),
    })
}

fn is_kernel_release(field: &str) -> bool {
    ["3.", "4.", "5.", "6."]
        .iter()
        .any(|prefix| field.starts_with(prefix))
        && field.contains('-')
}

/// Periodically reports every registered connection to the manager
pub struct HeartbeatReporter {
    client: reqwest::Client,
    endpoint: String,
    interval: Duration,
    registry: Arc<ConnectionRegistry>,
}

impl HeartbeatReporter {
    pub fn new(config: ReporterConfig, registry: Arc<ConnectionRegistry>) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}{}",
                config.manager_url.trim_end_matches('/'),
                BASIC_INFO_PATH
            ),
            interval: config.interval,
            registry,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Report on every interval until `shutdown` is cancelled
    ///
    /// The first report is sent one interval after start.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(endpoint = %self.endpoint, "Heartbeat reporter started ({:?} interval)", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Heartbeat reporter stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let reported = self.report_once().await;
                    debug!("Reported {} agent(s)", reported);
                }
            }
        }
    }

    /// Report every connection in the current registry snapshot
    ///
    /// Returns the number of reports the manager accepted. Failures are
    /// logged per agent.
    pub async fn report_once(&self) -> usize {
        let mut accepted = 0;
        for connection in self.registry.snapshot() {
            let report = BasicInfoReport::from_connection(&connection);
            match self.post(&report).await {
                Ok(response) if response.status == 200 => accepted += 1,
                Ok(response) => warn!(
                    agent_id = %connection.agent_id,
                    tenant_id = report.tenant_id,
                    "Manager refused basic info (status {}): {}",
                    response.status,
                    response.msg
                ),
                Err(e) => error!(
                    agent_id = %connection.agent_id,
                    "Report basic info failed: {}",
                    e
                ),
            }
        }
        accepted
    }

    async fn post(&self, report: &BasicInfoReport) -> Result<ReportResponse, ReportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(report)
            .send()
            .await?
            .json()
            .await?;
        Ok(response)
    }
}
